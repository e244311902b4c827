use super::helpers::{f32_mem, read_f32, run_ranks};
use hcoll::{AlgorithmChoice, DataType, DeviceMem, HcollConfig, OpKind, OperationDescriptor, TopologyShape};

#[tokio::test]
async fn test_sendrecv_ring_shift() {
    let shape = TopologyShape::new([2, 2]);
    let world = shape.world_size() as u32;
    let count = 10;
    let results = run_ranks(shape, HcollConfig::default(), move |cx| async move {
        let next = (cx.rank + 1) % world;
        let prev = (cx.rank + world - 1) % world;
        let desc = OperationDescriptor::new(OpKind::SendRecv, count, DataType::F32, cx.stream())
            .with_peers(Some(next), Some(prev));
        let input = f32_mem(&vec![cx.rank as f32; count]);
        let output = DeviceMem::alloc(count * 4);
        cx.execute(&desc, AlgorithmChoice::empty(), &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;

    for (rank, got) in results.iter().enumerate() {
        let prev = (rank as u32 + world - 1) % world;
        assert_eq!(got, &vec![prev as f32; count], "rank {rank}");
    }
}

#[tokio::test]
async fn test_sendrecv_one_direction() {
    let results = run_ranks(TopologyShape::new([2]), HcollConfig::default(), |cx| async move {
        let (send, recv) = if cx.rank == 0 { (Some(1), None) } else { (None, Some(0)) };
        let desc = OperationDescriptor::new(OpKind::SendRecv, 4, DataType::F32, cx.stream()).with_peers(send, recv);
        let input = f32_mem(&[1.5, 2.5, 3.5, 4.5]);
        let output = DeviceMem::alloc(16);
        cx.execute(&desc, AlgorithmChoice::empty(), &input, &output).await.unwrap();
        read_f32(&output)
    })
    .await;
    assert_eq!(results[0], vec![0.0; 4]);
    assert_eq!(results[1], vec![1.5, 2.5, 3.5, 4.5]);
}

#[tokio::test]
async fn test_sendrecv_self_pair_copies() {
    let results = run_ranks(TopologyShape::new([2]), HcollConfig::default(), |cx| async move {
        let desc = OperationDescriptor::new(OpKind::SendRecv, 3, DataType::F32, cx.stream())
            .with_peers(Some(cx.rank), Some(cx.rank));
        let input = f32_mem(&[cx.rank as f32, 7.0, 8.0]);
        let output = DeviceMem::alloc(12);
        cx.execute(&desc, AlgorithmChoice::empty(), &input, &output).await.unwrap();

        let mismatched = OperationDescriptor::new(OpKind::SendRecv, 3, DataType::F32, cx.stream())
            .with_peers(Some(cx.rank), Some(cx.rank));
        let err = cx
            .execute(&mismatched, AlgorithmChoice::empty(), &input, &DeviceMem::alloc(16))
            .await
            .unwrap_err();
        assert!(err.is_parameter_error());
        read_f32(&output)
    })
    .await;
    assert_eq!(results[1], vec![1.0, 7.0, 8.0]);
}
