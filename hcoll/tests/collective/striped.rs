use super::helpers::{f32_mem, read_f32, run_ranks};
use hcoll::template::PlaneSplit;
use hcoll::{Algorithm, AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, TopologyShape};

fn block(rank: u32, count: usize) -> Vec<f32> {
    (0..count).map(|i| rank as f32 * 1000.0 + i as f32).collect()
}

async fn run_striped(shape: TopologyShape, config: HcollConfig, count: usize) -> Vec<AlgorithmChoice> {
    let world = shape.world_size();
    let results = run_ranks(shape, config, move |cx| async move {
        let bytes = (count * 4) as u64;
        let choice = cx.selector.select(OpKind::AllGather, bytes, &cx.shape, true, true).unwrap();
        let desc = OperationDescriptor::new(OpKind::AllGather, count, DataType::F32, cx.stream());
        let input = f32_mem(&block(cx.rank, count));
        let output = DeviceMem::alloc(world * count * 4);
        cx.execute(&desc, choice, &input, &output).await.unwrap();
        (choice, read_f32(&output))
    })
    .await;

    let expected: Vec<f32> = (0..world as u32).flat_map(|r| block(r, count)).collect();
    results
        .into_iter()
        .enumerate()
        .map(|(rank, (choice, got))| {
            assert_eq!(got, expected, "rank {rank}");
            choice
        })
        .collect()
}

#[tokio::test]
async fn test_large_allgather_runs_striped_pipeline() {
    // 64 KiB per rank clears the lite threshold on a mesh node
    let choices = run_striped(TopologyShape::new([4, 2]).with_mesh(), HcollConfig::default(), 16 * 1024).await;
    assert!(choices.iter().all(|c| c.level(1) == Some(Algorithm::Pipeline)));
}

#[tokio::test]
async fn test_striped_equal_planes_uneven_block() {
    let config = HcollConfig {
        plane_split: PlaneSplit::Equal(3),
        pipeline_min_bytes_lite: 0,
        pipeline_sub_slices: 3,
        ..Default::default()
    };
    let choices = run_striped(TopologyShape::new([2, 3]).with_mesh(), config, 1001).await;
    assert!(choices.iter().all(|c| c.level(1) == Some(Algorithm::Pipeline)));
}

#[tokio::test]
async fn test_small_allgather_stays_hierarchical() {
    let choices = run_striped(TopologyShape::new([4, 2]).with_mesh(), HcollConfig::default(), 64).await;
    assert!(choices.iter().all(|c| c.level(1) != Some(Algorithm::Pipeline)));
}
