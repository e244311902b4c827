pub mod config;
pub mod error;
pub mod executor;
pub mod link;
pub mod memory;
pub mod reduce;
pub mod registry;
pub mod selector;
pub mod slice;
pub mod stream;
pub mod sync;
pub mod template;
pub mod topology;
pub mod transport;
pub mod types;

pub use config::HcollConfig;
pub use error::{HcollError, Result};
pub use executor::{HierarchicalExecutor, OperationDescriptor, ResourceRequest, ResourceResponse};
pub use link::{Link, LinkRef, LinkType};
pub use memory::{DeviceMem, ExecMem};
pub use registry::{TemplateFactory, TemplateRegistry};
pub use selector::{Algorithm, AlgorithmChoice, AlgorithmSelector};
pub use slice::Slice;
pub use stream::{Signal, Stream};
pub use sync::{Dispatcher, HostDispatcher, TaskLog, TaskObserver};
pub use template::{AlgTemplate, AllToAllPhase, ExecContext, PhasedTemplate, PrepareArgs, TemplateKind};
pub use topology::{CommPlane, StaticTopology, Topology, TopologyShape};
pub use transport::LocalFabric;
pub use types::{DataType, OpKind, Rank, ReduceOp, UserMemType};
