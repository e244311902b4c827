use super::helpers::{f32_mem, read_f32, run_ranks};
use hcoll::{Algorithm, AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, TopologyShape};

fn payload(count: usize) -> Vec<f32> {
    (0..count).map(|i| i as f32 * 0.5 - 3.0).collect()
}

async fn run_broadcast(shape: TopologyShape, choice: AlgorithmChoice, root: u32, count: usize, in_place: bool) {
    let results = run_ranks(shape, HcollConfig::default(), move |cx| async move {
        let desc = OperationDescriptor::new(OpKind::Broadcast, count, DataType::F32, cx.stream()).with_root(root);
        let (input, output) = if cx.rank == root {
            let data = f32_mem(&payload(count));
            if in_place {
                (data.clone(), data)
            } else {
                (data, DeviceMem::alloc(count * 4))
            }
        } else {
            (DeviceMem::alloc(0), DeviceMem::alloc(count * 4))
        };
        cx.execute(&desc, choice, &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;

    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got, &payload(count), "rank {rank}");
    }
}

#[tokio::test]
async fn test_broadcast_chain_then_tree() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::HalvingDoubling]).unwrap();
    run_broadcast(TopologyShape::new([4, 3]), choice, 6, 50, false).await;
}

#[tokio::test]
async fn test_broadcast_three_levels_in_place() {
    let choice = AlgorithmChoice::from_levels(&[Algorithm::Mesh, Algorithm::Ring, Algorithm::Nhr]).unwrap();
    run_broadcast(TopologyShape::new([2, 2, 2]).with_mesh(), choice, 5, 13, true).await;
}

#[tokio::test]
async fn test_broadcast_selected_choice() {
    let shape = TopologyShape::new([2, 4]);
    let results = run_ranks(shape, HcollConfig::default(), |cx| async move {
        cx.selector
            .select(OpKind::Broadcast, 4096, &cx.shape, false, false)
            .unwrap()
    })
    .await;
    let choice = results[0];
    assert!(results.iter().all(|&c| c == choice));
    assert_ne!(choice.level(1), Some(Algorithm::Pipeline));
    run_broadcast(TopologyShape::new([2, 4]), choice, 0, 1024, false).await;
}
