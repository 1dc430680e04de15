use crate::support::cluster;
use vdfs::net::{seal_message, Call, WireRequest, WireResponse};
use vdfs::tree::EntryAttrs;
use vdfs::FsError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flipped_bit_is_rejected_without_effect() {
    let cluster = cluster(|_, _| {}).await;
    let (a, b) = (cluster.get(0), cluster.get(1));

    // A newer root from b that a would otherwise accept
    let (node, next_inode) = {
        let mut graph = b.graph().await;
        let root = graph.root();
        graph.create(root, "x", &EntryAttrs::file()).unwrap();
        graph.flush_root().unwrap();
        (graph.root_blob().unwrap(), graph.next_inode())
    };
    let key = b.session().get().unwrap();
    let sealed = seal_message(&key, &Call::Receive { node, next_inode }).unwrap();
    let before = a.head().unwrap().unwrap();

    let mut tampered = sealed.clone();
    let mid = tampered.len() / 2;
    tampered[mid] ^= 0x01;

    let client = cluster.raw_client(0);
    let err = client
        .exchange(WireRequest::Sealed(tampered))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AuthenticationFailure(_)));
    assert_eq!(a.head().unwrap().unwrap(), before);

    // The intact message goes through on a fresh connection
    match client.exchange(WireRequest::Sealed(sealed)).await.unwrap() {
        WireResponse::Sealed(_) => {}
        other => panic!("unexpected response: {:?}", other),
    }
    assert_ne!(a.head().unwrap().unwrap(), before);
    assert!(a.resolve("x").await.is_ok());
}
