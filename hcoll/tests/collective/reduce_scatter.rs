use super::helpers::{f32_mem, read_f32, run_ranks};
use hcoll::{
    Algorithm, AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, ReduceOp,
    TopologyShape,
};

fn input(rank: u32, len: usize) -> Vec<f32> {
    (0..len).map(|i| (rank + 1) as f32 * (i % 7 + 1) as f32).collect()
}

async fn run_reduce_scatter(shape: TopologyShape, choice: Option<AlgorithmChoice>, count: usize, op: ReduceOp) {
    let world = shape.world_size();
    let results = run_ranks(shape, HcollConfig::default(), move |cx| async move {
        let desc = OperationDescriptor::new(OpKind::ReduceScatter, count, DataType::F32, cx.stream()).with_reduce(op);
        let choice = match choice {
            Some(c) => c,
            None => cx
                .selector
                .select(OpKind::ReduceScatter, (count * 4) as u64, &cx.shape, true, true)
                .unwrap(),
        };
        let input = f32_mem(&input(cx.rank, world * count));
        let output = DeviceMem::alloc(count * 4);
        cx.execute(&desc, choice, &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;

    let inputs: Vec<Vec<f32>> = (0..world as u32).map(|r| input(r, world * count)).collect();
    for (rank, got) in results.iter().enumerate() {
        let expected: Vec<f32> = (0..count)
            .map(|i| {
                let idx = rank * count + i;
                let vals = inputs.iter().map(|v| v[idx]);
                match op {
                    ReduceOp::Sum => vals.sum(),
                    ReduceOp::Max => vals.fold(f32::MIN, f32::max),
                    ReduceOp::Min => vals.fold(f32::MAX, f32::min),
                    ReduceOp::Prod => vals.product(),
                }
            })
            .collect();
        assert_eq!(got, &expected, "rank {rank}");
    }
}

#[tokio::test]
async fn test_reduce_scatter_mesh_inner_level() {
    run_reduce_scatter(TopologyShape::new([4, 2]).with_mesh(), None, 6, ReduceOp::Sum).await;
}

#[tokio::test]
async fn test_reduce_scatter_ring_fallback() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::HalvingDoubling]).unwrap();
    run_reduce_scatter(TopologyShape::new([2, 3]), Some(choice), 5, ReduceOp::Max).await;
}

#[tokio::test]
async fn test_reduce_scatter_single_level() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring]).unwrap();
    run_reduce_scatter(TopologyShape::new([5]), Some(choice), 3, ReduceOp::Sum).await;
}
