use super::helpers::{f32_mem, read_f32, run_ranks};
use hcoll::{Algorithm, AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, TopologyShape};

fn contribution(rank: u32, count: usize) -> Vec<f32> {
    (0..count).map(|i| (rank * 100) as f32 + i as f32).collect()
}

async fn run_allgather(shape: TopologyShape, choice: Option<AlgorithmChoice>, count: usize) {
    let world = shape.world_size();
    let results = run_ranks(shape, HcollConfig::default(), move |cx| async move {
        let stream = cx.stream();
        let desc = OperationDescriptor::new(OpKind::AllGather, count, DataType::F32, stream);
        let choice = match choice {
            Some(c) => c,
            None => cx
                .selector
                .select(OpKind::AllGather, (count * 4) as u64, &cx.shape, true, true)
                .unwrap(),
        };
        let input = f32_mem(&contribution(cx.rank, count));
        let output = DeviceMem::alloc(world * count * 4);
        cx.execute(&desc, choice, &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;

    let expected: Vec<f32> = (0..world as u32).flat_map(|r| contribution(r, count)).collect();
    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got, &expected, "rank {rank}");
    }
}

#[tokio::test]
async fn test_allgather_selected_mesh_and_ring() {
    run_allgather(TopologyShape::new([4, 2]).with_mesh(), None, 5).await;
}

#[tokio::test]
async fn test_allgather_nhr_outer_level() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::Nhr]).unwrap();
    run_allgather(TopologyShape::new([2, 3]), Some(choice), 7).await;
}

#[tokio::test]
async fn test_allgather_three_levels() {
    let choice =
        AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::HalvingDoubling, Algorithm::Nhr]).unwrap();
    run_allgather(TopologyShape::new([2, 3, 2]), Some(choice), 3).await;
}

#[tokio::test]
async fn test_allgather_skips_unit_level() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::Ring, Algorithm::HalvingDoubling])
        .unwrap();
    run_allgather(TopologyShape::new([3, 1, 2]), Some(choice), 4).await;
}

#[tokio::test]
async fn test_allgather_single_rank() {
    run_allgather(TopologyShape::new([1]), Some(AlgorithmChoice::empty()), 9).await;
}

#[tokio::test]
async fn test_allgather_strided_output() {
    let shape = TopologyShape::new([2, 2]);
    let (count, stride) = (3usize, 5usize);
    let world = shape.world_size();
    let results = run_ranks(shape, HcollConfig::default(), move |cx| async move {
        let desc = OperationDescriptor::new(OpKind::AllGather, count, DataType::F32, cx.stream())
            .with_stride(stride as u64);
        let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::Ring]).unwrap();
        let input = f32_mem(&contribution(cx.rank, count));
        let output = f32_mem(&vec![-1.0; (world - 1) * stride + count]);
        cx.execute(&desc, choice, &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;

    for got in results {
        for r in 0..world {
            assert_eq!(&got[r * stride..r * stride + count], contribution(r as u32, count).as_slice());
            if r + 1 < world {
                // gaps between blocks are left untouched
                assert!(got[r * stride + count..(r + 1) * stride].iter().all(|&v| v == -1.0));
            }
        }
    }
}
