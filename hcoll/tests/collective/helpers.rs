use hcoll::{
    AlgorithmChoice, AlgorithmSelector, DeviceMem, ExecContext, HcollConfig, HierarchicalExecutor, HostDispatcher,
    LocalFabric, OperationDescriptor, Rank, ResourceResponse, Result, StaticTopology, Stream, TemplateRegistry,
    TopologyShape,
};
use std::sync::Arc;

/// Parallel link sets offered on every communicator.
pub const PLANES: usize = 8;

/// One rank's view of a multi-rank test run.
pub struct RankCtx {
    pub rank: Rank,
    pub shape: TopologyShape,
    pub executor: HierarchicalExecutor,
    pub selector: AlgorithmSelector,
}

impl RankCtx {
    pub fn world(&self) -> usize {
        self.shape.world_size()
    }

    /// Fresh main stream for this rank.
    pub fn stream(&self) -> Stream {
        Stream::new(self.rank * 1000).unwrap()
    }

    /// Size, allocate, enqueue and wait for `desc`.
    pub async fn execute(
        &self,
        desc: &OperationDescriptor,
        choice: AlgorithmChoice,
        input: &DeviceMem,
        output: &DeviceMem,
    ) -> Result<()> {
        let req = self.executor.resource_request(desc, choice)?;
        let res = ResourceResponse::allocate(&req, self.rank * 1000 + 100)?;
        self.executor.orchestrate(desc, choice, input, output, &res)?;
        desc.stream.synchronize().await
    }
}

/// Executor for `rank` of `shape` over `fabric`.
pub fn executor(
    rank: Rank,
    shape: TopologyShape,
    fabric: LocalFabric,
    config: Arc<HcollConfig>,
    registry: Arc<TemplateRegistry>,
) -> HierarchicalExecutor {
    let topo = StaticTopology::new(rank, shape, fabric, PLANES).unwrap();
    let ctx = ExecContext::new(Arc::new(HostDispatcher::new()), config);
    HierarchicalExecutor::new(Arc::new(topo), registry, ctx)
}

/// Helper: run `f` on every rank of `shape` concurrently, one tokio task per
/// rank, and collect the results in rank order.
pub async fn run_ranks<F, Fut, T>(shape: TopologyShape, config: HcollConfig, f: F) -> Vec<T>
where
    F: Fn(RankCtx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let fabric = LocalFabric::from_config(&config);
    let config = Arc::new(config);
    let registry = Arc::new(TemplateRegistry::with_defaults());
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for rank in 0..shape.world_size() as Rank {
        let cx = RankCtx {
            rank,
            shape: shape.clone(),
            executor: executor(rank, shape.clone(), fabric.clone(), Arc::clone(&config), Arc::clone(&registry)),
            selector: AlgorithmSelector::new(config.as_ref().clone()),
        };
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(cx).await }));
    }
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

pub fn f32_mem(values: &[f32]) -> DeviceMem {
    DeviceMem::from_bytes(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

pub fn read_f32(mem: &DeviceMem) -> Vec<f32> {
    mem.read()
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
