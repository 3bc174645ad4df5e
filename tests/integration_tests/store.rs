use crate::common::{TestEnv, env, run_git};
use gion::git::GionError;
use gion::store;
use gion::workspace::{self, Metadata};
use rstest::rstest;

#[rstest]
fn test_get_clones_store_and_src(env: TestEnv) {
    let api = env.remote("api");

    let store = store::get(&env.root, &api.location, &env.cancel).unwrap();

    assert_eq!(store.key(), "example.com/acme/api");
    assert_eq!(
        store.store_path,
        env.root.dir().join("bare/example.com/acme/api.git")
    );
    assert!(store.store_path.join("HEAD").is_file());

    // origin/HEAD points at the remote default branch
    let origin_head = run_git(
        &store.store_path,
        &["symbolic-ref", "refs/remotes/origin/HEAD"],
    );
    assert_eq!(origin_head, "refs/remotes/origin/main");

    // The convenience clone talks to the real remote, not the store
    let src = env.root.dir().join("src/example.com/acme/api");
    assert_eq!(
        run_git(&src, &["remote", "get-url", "origin"]),
        api.location
    );
}

#[rstest]
fn test_get_fetches_once_then_only_when_remote_moves(env: TestEnv) {
    let api = env.remote("api");
    store::get(&env.root, &api.location, &env.cancel).unwrap();
    assert_eq!(env.git.fetch_count(), 1);

    // Unchanged remote: no network fetch
    env.git.reset();
    store::open(&env.root, &api.location, false, &env.cancel).unwrap();
    store::get(&env.root, &api.location, &env.cancel).unwrap();
    assert_eq!(env.git.fetch_count(), 0);

    // Remote default branch moved: exactly one fetch
    api.push_main("second");
    store::open(&env.root, &api.location, false, &env.cancel).unwrap();
    assert_eq!(env.git.fetch_count(), 1);

    let store_path = env.root.dir().join("bare/example.com/acme/api.git");
    assert_eq!(
        run_git(&store_path, &["rev-parse", "refs/remotes/origin/main"]),
        run_git(&api.bare, &["rev-parse", "main"])
    );

    // An explicit request always fetches
    env.git.reset();
    store::open(&env.root, &api.location, true, &env.cancel).unwrap();
    assert_eq!(env.git.fetch_count(), 1);
}

#[rstest]
fn test_open_prunes_unused_local_heads(env: TestEnv) {
    let api = env.remote("api");
    api.push_branch("feature");
    let store = store::get(&env.root, &api.location, &env.cancel).unwrap();

    let heads = run_git(
        &store.store_path,
        &["for-each-ref", "--format=%(refname)", "refs/heads"],
    );
    assert_eq!(heads, "refs/heads/main");
    // The branch is still reachable as a remote-tracking ref
    run_git(&store.store_path, &["rev-parse", "refs/remotes/origin/feature"]);
}

#[rstest]
fn test_open_keeps_heads_backing_worktrees(env: TestEnv) {
    let api = env.remote("api");
    workspace::create(&env.root, "PROJ-1", &Metadata::default(), &env.cancel).unwrap();
    env.add("PROJ-1", &api);

    let store_path = env.root.dir().join("bare/example.com/acme/api.git");
    run_git(&store_path, &["update-ref", "refs/heads/stray", "refs/heads/main"]);

    store::open(&env.root, &api.location, false, &env.cancel).unwrap();

    let heads = run_git(
        &store_path,
        &["for-each-ref", "--format=%(refname)", "refs/heads"],
    );
    assert_eq!(heads, "refs/heads/PROJ-1\nrefs/heads/main");
    run_git(&store_path, &["rev-parse", "--verify", "refs/heads/PROJ-1"]);
}

#[rstest]
fn test_open_missing_store(env: TestEnv) {
    let api = env.remote("api");
    let err = store::open(&env.root, &api.location, false, &env.cancel).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::NotFound { what: "repo store", .. })
    ));
}

#[rstest]
fn test_list_stores(env: TestEnv) {
    let api = env.remote("api");
    let web = env.remote("web");
    store::get(&env.root, &web.location, &env.cancel).unwrap();
    store::get(&env.root, &api.location, &env.cancel).unwrap();

    let keys: Vec<String> = store::list(&env.root)
        .unwrap()
        .iter()
        .map(|identity| identity.key())
        .collect();
    assert_eq!(keys, vec!["example.com/acme/api", "example.com/acme/web"]);
}
