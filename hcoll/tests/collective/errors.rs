use super::helpers::{PLANES, executor, f32_mem};
use hcoll::{
    Algorithm, AlgorithmChoice, AlgorithmSelector, DataType, DeviceMem, ExecContext, HcollConfig, HcollError,
    HierarchicalExecutor, HostDispatcher, LocalFabric, OpKind, OperationDescriptor, ReduceOp, ResourceRequest,
    ResourceResponse, StaticTopology, Stream, TaskLog, TemplateKind, TemplateRegistry, TopologyShape,
};
use hcoll::registry::factory;
use hcoll::template::AllGatherNhr;
use std::sync::Arc;
use std::time::Duration;

fn lone_executor(shape: TopologyShape) -> HierarchicalExecutor {
    executor(
        0,
        shape,
        LocalFabric::default(),
        Arc::new(HcollConfig::default()),
        Arc::new(TemplateRegistry::with_defaults()),
    )
}

#[tokio::test]
async fn test_mesh_without_aux_streams() {
    let exec = lone_executor(TopologyShape::new([4]).with_mesh());
    let desc = OperationDescriptor::new(OpKind::AllGather, 4, DataType::F32, Stream::new(0).unwrap());
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Mesh]).unwrap();
    let req = exec.resource_request(&desc, choice).unwrap();
    assert_eq!(req.stream_count, 3);

    let err = exec
        .orchestrate(&desc, choice, &DeviceMem::alloc(16), &DeviceMem::alloc(64), &ResourceResponse::default())
        .unwrap_err();
    assert!(matches!(err, HcollError::InsufficientStreams { required: 3, available: 0 }));
    assert!(err.is_resource_error());
}

#[tokio::test]
async fn test_reduce_scatter_scratch_too_small() {
    let exec = lone_executor(TopologyShape::new([2, 2]));
    let desc = OperationDescriptor::new(OpKind::ReduceScatter, 4, DataType::F32, Stream::new(0).unwrap())
        .with_reduce(ReduceOp::Sum);
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::Ring]).unwrap();
    let req = exec.resource_request(&desc, choice).unwrap();
    let short = ResourceRequest {
        scratch_bytes: req.scratch_bytes - 4,
        ..req
    };
    let res = ResourceResponse::allocate(&short, 10).unwrap();
    let err = exec
        .orchestrate(&desc, choice, &DeviceMem::alloc(64), &DeviceMem::alloc(16), &res)
        .unwrap_err();
    assert!(matches!(err, HcollError::ScratchTooSmall { .. }));
}

#[tokio::test]
async fn test_parameter_errors_precede_any_transfer() {
    let exec = lone_executor(TopologyShape::new([2]));
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring]).unwrap();
    let stream = Stream::new(0).unwrap();

    let no_op = OperationDescriptor::new(OpKind::AllReduce, 4, DataType::F32, stream.clone());
    assert!(exec.resource_request(&no_op, choice).unwrap_err().is_parameter_error());

    let half = OperationDescriptor::new(OpKind::AllReduce, 4, DataType::F16, stream.clone()).with_reduce(ReduceOp::Sum);
    assert!(matches!(
        exec.resource_request(&half, choice),
        Err(HcollError::UnsupportedDType { .. })
    ));

    let stride = OperationDescriptor::new(OpKind::AllGather, 4, DataType::F32, stream.clone()).with_stride(2);
    assert!(matches!(
        exec.resource_request(&stride, choice),
        Err(HcollError::InvalidStride { stride: 2, count: 4 })
    ));

    let short = OperationDescriptor::new(OpKind::AllGather, 4, DataType::F32, stream.clone());
    let err = exec
        .orchestrate(&short, choice, &DeviceMem::alloc(8), &DeviceMem::alloc(32), &ResourceResponse::default())
        .unwrap_err();
    assert!(matches!(err, HcollError::BufferSizeMismatch { expected: 16, actual: 8 }));
    stream.synchronize().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_template() {
    let mut registry = TemplateRegistry::new();
    registry.register(TemplateKind::AllGatherNhr, factory::<AllGatherNhr>());
    let exec = executor(
        0,
        TopologyShape::new([2]),
        LocalFabric::default(),
        Arc::new(HcollConfig::default()),
        Arc::new(registry),
    );
    let desc = OperationDescriptor::new(OpKind::AllGather, 4, DataType::F32, Stream::new(0).unwrap());
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring]).unwrap();
    let err = exec
        .orchestrate(&desc, choice, &DeviceMem::alloc(16), &DeviceMem::alloc(32), &ResourceResponse::default())
        .unwrap_err();
    assert!(matches!(err, HcollError::UnregisteredTemplate(TemplateKind::AllGatherRing)));
}

#[tokio::test]
async fn test_empty_operation_enqueues_nothing() {
    let log = Arc::new(TaskLog::new());
    let topo = StaticTopology::new(1, TopologyShape::new([4]), LocalFabric::default(), PLANES).unwrap();
    let exec = HierarchicalExecutor::new(
        Arc::new(topo),
        Arc::new(TemplateRegistry::with_defaults()),
        ExecContext::new(
            Arc::new(HostDispatcher::with_observer(log.clone())),
            Arc::new(HcollConfig::default()),
        ),
    );
    let stream = Stream::new(0).unwrap();
    let desc = OperationDescriptor::new(OpKind::AllReduce, 0, DataType::F32, stream.clone()).with_reduce(ReduceOp::Sum);
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring]).unwrap();
    let req = exec.resource_request(&desc, choice).unwrap();
    let res = ResourceResponse::allocate(&req, 10).unwrap();
    exec.orchestrate(&desc, choice, &DeviceMem::alloc(0), &DeviceMem::alloc(0), &res)
        .unwrap();
    stream.synchronize().await.unwrap();
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_no_cost_model_for_alltoall() {
    let selector = AlgorithmSelector::new(HcollConfig::default());
    let err = selector
        .select(OpKind::AllToAll, 1024, &TopologyShape::new([4, 2]), true, true)
        .unwrap_err();
    assert!(matches!(err, HcollError::NoCostModel(OpKind::AllToAll)));
}

#[tokio::test]
async fn test_missing_peer_times_out_on_stream() {
    // Rank 1 never runs, so rank 0's first receive expires.
    let config = HcollConfig {
        transfer_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let exec = executor(
        0,
        TopologyShape::new([2]),
        LocalFabric::from_config(&config),
        Arc::new(config),
        Arc::new(TemplateRegistry::with_defaults()),
    );
    let stream = Stream::new(0).unwrap();
    let desc = OperationDescriptor::new(OpKind::AllGather, 2, DataType::F32, stream.clone());
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring]).unwrap();
    let output = DeviceMem::alloc(16);
    exec.orchestrate(&desc, choice, &f32_mem(&[1.0, 2.0]), &output, &ResourceResponse::default())
        .unwrap();
    match stream.synchronize().await {
        Err(HcollError::StreamFailed { stream: 0, reason }) => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected a failed stream, got {other:?}"),
    }
    // the seed copy ran before the failure
    assert_eq!(&output.read().unwrap()[..8], &f32_mem(&[1.0, 2.0]).read().unwrap()[..]);
}

#[tokio::test]
async fn test_link_set_shortfall_is_parameter_error() {
    let log = Arc::new(TaskLog::new());
    // one link set per communicator, the sliced all-to-all needs one per plane
    let topo = StaticTopology::new(0, TopologyShape::new([2, 2]), LocalFabric::default(), 1).unwrap();
    let exec = HierarchicalExecutor::new(
        Arc::new(topo),
        Arc::new(TemplateRegistry::with_defaults()),
        ExecContext::new(
            Arc::new(HostDispatcher::with_observer(log.clone())),
            Arc::new(HcollConfig::default()),
        ),
    );
    let desc = OperationDescriptor::new(OpKind::AllToAll, 2, DataType::F32, Stream::new(0).unwrap());
    let req = exec.resource_request(&desc, AlgorithmChoice::empty()).unwrap();
    let res = ResourceResponse::allocate(&req, 10).unwrap();
    let err = exec
        .orchestrate(&desc, AlgorithmChoice::empty(), &DeviceMem::alloc(32), &DeviceMem::alloc(32), &res)
        .unwrap_err();
    assert!(err.is_parameter_error(), "{err}");
    assert!(log.is_empty());
}
