use super::helpers::run_ranks;
use hcoll::{AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, TopologyShape};

fn pair_payload(src: usize, dst: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (src * 29 + dst * 7 + i) as u8).collect()
}

async fn run_alltoall(shape: TopologyShape, flattened: bool, count: usize) {
    let world = shape.world_size();
    let config = HcollConfig {
        alltoall_pieces: 5,
        alltoall_planes: 3,
        alltoall_flattened: flattened,
        ..Default::default()
    };
    let results = run_ranks(shape, config, move |cx| async move {
        let desc = OperationDescriptor::new(OpKind::AllToAll, count, DataType::U8, cx.stream());
        let input = DeviceMem::from_bytes((0..world).flat_map(|d| pair_payload(cx.rank as usize, d, count)).collect());
        let output = DeviceMem::alloc(world * count);
        cx.execute(&desc, AlgorithmChoice::empty(), &input, &output).await.unwrap();
        output.read().unwrap()
    })
    .await;

    for (rank, got) in results.iter().enumerate() {
        let expected: Vec<u8> = (0..world).flat_map(|s| pair_payload(s, rank, count)).collect();
        assert_eq!(got, &expected, "rank {rank}");
    }
}

#[tokio::test]
async fn test_alltoall_per_phase_levels() {
    run_alltoall(TopologyShape::new([3, 2]), false, 11).await;
}

#[tokio::test]
async fn test_alltoall_flattened_by_config() {
    run_alltoall(TopologyShape::new([2, 3]), true, 9).await;
}

#[tokio::test]
async fn test_alltoall_deep_shape_flattens() {
    run_alltoall(TopologyShape::new([2, 2, 2]), false, 4).await;
}

#[tokio::test]
async fn test_alltoall_single_rank() {
    run_alltoall(TopologyShape::new([1]), false, 6).await;
}
