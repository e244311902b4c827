use super::helpers::{f32_mem, read_f32, run_ranks};
use hcoll::{
    Algorithm, AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, ReduceOp,
    TopologyShape,
};

fn values(rank: u32, count: usize) -> Vec<f32> {
    (0..count).map(|i| (rank as usize * 3 + i % 11) as f32).collect()
}

async fn run_allreduce(shape: TopologyShape, choice: Option<AlgorithmChoice>, count: usize, in_place: bool) {
    let world = shape.world_size();
    let results = run_ranks(shape, HcollConfig::default(), move |cx| async move {
        let desc = OperationDescriptor::new(OpKind::AllReduce, count, DataType::F32, cx.stream())
            .with_reduce(ReduceOp::Sum)
            .with_tag(format!("allreduce-{}", cx.rank));
        let choice = match choice {
            Some(c) => c,
            None => cx
                .selector
                .select(OpKind::AllReduce, (count * 4) as u64, &cx.shape, true, true)
                .unwrap(),
        };
        let input = f32_mem(&values(cx.rank, count));
        let output = if in_place { input.clone() } else { DeviceMem::alloc(count * 4) };
        cx.execute(&desc, choice, &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;

    let expected: Vec<f32> = (0..count)
        .map(|i| (0..world as u32).map(|r| values(r, count)[i]).sum())
        .collect();
    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got, &expected, "rank {rank}");
    }
}

#[tokio::test]
async fn test_allreduce_two_levels_uneven_count() {
    run_allreduce(TopologyShape::new([4, 2]).with_mesh(), None, 37, false).await;
}

#[tokio::test]
async fn test_allreduce_in_place() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::Nhr]).unwrap();
    run_allreduce(TopologyShape::new([2, 3]), Some(choice), 20, true).await;
}

#[tokio::test]
async fn test_allreduce_three_levels() {
    let choice =
        AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::HalvingDoubling, Algorithm::Ring]).unwrap();
    run_allreduce(TopologyShape::new([2, 2, 2]), Some(choice), 16, false).await;
}

#[tokio::test]
async fn test_allreduce_count_smaller_than_world() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::Ring]).unwrap();
    run_allreduce(TopologyShape::new([3, 2]), Some(choice), 2, false).await;
}
