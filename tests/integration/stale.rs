use crate::support::cluster;
use vdfs::net::Call;
use vdfs::tree::EntryAttrs;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_older_root_push_leaves_state_unchanged() {
    let cluster = cluster(|_, _| {}).await;
    let (a, b) = (cluster.get(0), cluster.get(1));

    // b commits locally but does not push yet
    let (old_root, next_inode) = {
        let mut graph = b.graph().await;
        let root = graph.root();
        graph.create(root, "late", &EntryAttrs::file()).unwrap();
        graph.flush_root().unwrap();
        (graph.root_blob().unwrap(), graph.next_inode())
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let root = a.root().await;
    a.create(root, "early", &EntryAttrs::file()).await.unwrap();
    a.flush_cycle().await.unwrap();
    let head = a.head().unwrap().unwrap();

    let reply = b
        .peers()
        .peer(a.id())
        .unwrap()
        .call(b.session(), &Call::Receive { node: old_root, next_inode })
        .await
        .unwrap();
    assert!(!reply.ack);
    assert_eq!(a.head().unwrap().unwrap(), head);
    assert!(a.resolve("late").await.is_err());
    assert!(a.resolve("early").await.is_ok());
}
