use crate::support::cluster;
use std::time::Duration;
use vdfs::replication::{FlushPhase, Flusher};
use vdfs::tree::EntryAttrs;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_written_on_one_replica_reads_on_the_other() {
    let cluster = cluster(|_, _| {}).await;
    let (a, b) = (cluster.get(0), cluster.get(1));

    let root = a.root().await;
    let f = a.create(root, "f", &EntryAttrs::file()).await.unwrap();
    a.write(f, 0, b"hi").await.unwrap();
    a.flush_on_close(f).await.unwrap();

    let report = a.flush_cycle().await.unwrap();
    assert!(report.committed.is_some());
    let pushed = report.broadcast.unwrap();
    assert_eq!(pushed.delivered, vec![b.id()]);

    let a_head = a.head().unwrap().unwrap();
    assert_eq!(b.head().unwrap().unwrap().root_hash, a_head.root_hash);

    // b pulls the node and its data from a on first access
    let on_b = b.resolve("f").await.unwrap();
    assert_eq!(b.read_all(on_b).await.unwrap(), b"hi");
    {
        let graph = b.graph().await;
        assert_eq!(graph.node(on_b).unwrap().owner, a.id());
    }

    // b's own cycle sends the same root back; a already has it
    let echo = b.flush_cycle().await.unwrap();
    assert!(echo.committed.is_none());
    assert_eq!(a.head().unwrap().unwrap(), a_head);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_directories_converge_both_ways() {
    let cluster = cluster(|_, _| {}).await;
    let (a, b) = (cluster.get(0), cluster.get(1));

    let root = a.root().await;
    let docs = a.mkdir(root, "docs", &EntryAttrs::dir()).await.unwrap();
    let f = a.create(docs, "one", &EntryAttrs::file()).await.unwrap();
    a.write(f, 0, b"first").await.unwrap();
    a.flush_cycle().await.unwrap();

    let docs_b = b.resolve("docs").await.unwrap();
    let g = b.create(docs_b, "two", &EntryAttrs::file()).await.unwrap();
    b.write(g, 0, b"second").await.unwrap();
    b.flush_cycle().await.unwrap();

    let on_a = a.resolve("docs/two").await.unwrap();
    assert_eq!(a.read_all(on_a).await.unwrap(), b"second");
    let one = a.resolve("docs/one").await.unwrap();
    assert_eq!(a.read_all(one).await.unwrap(), b"first");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_flusher_commits_and_pushes() {
    let cluster = cluster(|_, _| {}).await;
    let (a, b) = (cluster.get(0), cluster.get(1));
    let initial = a.head().unwrap().unwrap();

    let root = a.root().await;
    let f = a.create(root, "f", &EntryAttrs::file()).await.unwrap();
    a.write(f, 0, b"tick").await.unwrap();

    let flusher = Flusher::start(a.clone(), Duration::from_millis(50));
    let mut converged = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let a_head = a.head().unwrap().unwrap();
        let b_head = b.head().unwrap().unwrap();
        if a_head.root_hash != initial.root_hash && b_head.root_hash == a_head.root_hash {
            converged = true;
            break;
        }
    }
    flusher.stop().await;
    assert!(converged, "b never adopted a's flushed root");
    assert_eq!(a.flush_phase(), FlushPhase::Idle);

    let on_b = b.resolve("f").await.unwrap();
    assert_eq!(b.read_all(on_b).await.unwrap(), b"tick");

    // stopped: a later change stays uncommitted
    let after_stop = a.head().unwrap().unwrap();
    a.write(f, 0, b"tock").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.head().unwrap().unwrap(), after_stop);
}
