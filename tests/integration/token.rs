use crate::support::cluster;
use vdfs::concurrency::TokenState;
use vdfs::config::ConsistencyMode;
use vdfs::tree::EntryAttrs;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_token_moves_to_the_writer() {
    let cluster = cluster(|name, config| {
        config.consistency = ConsistencyMode::Strong;
        config.token = name == "hub";
    })
    .await;
    let (a, b) = (cluster.get(0), cluster.get(1));
    assert_eq!(a.token_state(), TokenState::Holder);
    assert_eq!(b.token_state(), TokenState::NotHolder);

    let root = a.root().await;
    a.create(root, "from_a", &EntryAttrs::file()).await.unwrap();

    // b's write pulls the token over; a flushes and pushes before letting go
    let root_b = b.root().await;
    b.create(root_b, "from_b", &EntryAttrs::file()).await.unwrap();
    assert_eq!(b.token_state(), TokenState::Holder);
    assert_eq!(a.token_state(), TokenState::NotHolder);
    assert!(b.resolve("from_a").await.is_ok());

    // and back again
    b.flush_cycle().await.unwrap();
    a.mkdir(root, "again", &EntryAttrs::dir()).await.unwrap();
    assert_eq!(a.token_state(), TokenState::Holder);
    assert_eq!(b.token_state(), TokenState::NotHolder);
    assert!(a.resolve("from_b").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_holder_means_token_unavailable() {
    let cluster = cluster(|_, config| {
        config.consistency = ConsistencyMode::Strong;
        config.token = false;
        config.token_attempts = 2;
    })
    .await;
    let b = cluster.get(1);
    let root = b.root().await;
    let err = b.create(root, "nope", &EntryAttrs::file()).await.unwrap_err();
    assert!(matches!(err, vdfs::FsError::TokenUnavailable(_)));
    assert_eq!(b.token_state(), TokenState::NotHolder);
}
