use std::time::Duration;

use crate::common::{TestEnv, env};
use gion::git::{GionError, exit_code};
use gion::prefetch::Prefetcher;
use gion::store;
use rstest::rstest;

#[rstest]
fn test_prefetch_dedupes_by_identity(env: TestEnv) {
    let api = env.remote("api");
    store::get(&env.root, &api.location, &env.cancel).unwrap();
    env.git.reset();

    let prefetcher = Prefetcher::new(None);
    let locations = [api.location.as_str(), api.location.as_str()];
    assert!(prefetcher.start_all(&env.root, locations, &env.cancel).unwrap());
    assert!(prefetcher.start(&env.root, &api.location, &env.cancel).unwrap());
    prefetcher.wait_all(locations, &env.cancel).unwrap();

    assert_eq!(env.git.fetch_count(), 1);
}

#[rstest]
fn test_prefetch_skips_missing_store(env: TestEnv) {
    let api = env.remote("api");
    let prefetcher = Prefetcher::new(None);

    assert!(!prefetcher.start(&env.root, &api.location, &env.cancel).unwrap());
    prefetcher.wait(&api.location, &env.cancel).unwrap();
    assert_eq!(env.git.fetch_count(), 0);
}

#[rstest]
fn test_prefetch_failure_surfaces_on_wait(env: TestEnv) {
    let api = env.remote("api");
    store::get(&env.root, &api.location, &env.cancel).unwrap();
    env.git.fail_fetches(true);

    let prefetcher = Prefetcher::new(None);
    prefetcher.start(&env.root, &api.location, &env.cancel).unwrap();
    let err = prefetcher.wait(&api.location, &env.cancel).unwrap_err();

    match err.downcast_ref::<GionError>() {
        Some(GionError::PrefetchFailed { key, message }) => {
            assert_eq!(key, "example.com/acme/api");
            assert!(message.contains("unable to access remote"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[rstest]
fn test_prefetch_timeout_bounds_each_fetch(env: TestEnv) {
    let api = env.remote("api");
    store::get(&env.root, &api.location, &env.cancel).unwrap();
    env.git.delay_fetches(Duration::from_millis(300));

    let prefetcher = Prefetcher::new(Some(Duration::from_millis(50)));
    prefetcher.start(&env.root, &api.location, &env.cancel).unwrap();
    let err = prefetcher.wait(&api.location, &env.cancel).unwrap_err();

    match err.downcast_ref::<GionError>() {
        Some(GionError::PrefetchFailed { message, .. }) => {
            assert!(message.contains("timed out"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The caller's own token is untouched
    assert!(env.cancel.interrupted().is_none());
}

#[rstest]
fn test_prefetch_wait_observes_cancellation(env: TestEnv) {
    let api = env.remote("api");
    store::get(&env.root, &api.location, &env.cancel).unwrap();

    let prefetcher = Prefetcher::new(None);
    prefetcher.start(&env.root, &api.location, &env.cancel).unwrap();
    env.cancel.cancel();

    let err = prefetcher.wait(&api.location, &env.cancel).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::Cancelled)
    ));
    assert_eq!(exit_code(&err), 130);
}

#[rstest]
fn test_prefetch_start_all_continues_past_bad_store(env: TestEnv) {
    let api = env.remote("api");
    let web = env.remote("web");
    store::get(&env.root, &api.location, &env.cancel).unwrap();
    let web_store = env.root.dir().join("bare/example.com/acme/web.git");
    std::fs::write(&web_store, "not a store").unwrap();
    env.git.reset();

    let prefetcher = Prefetcher::new(None);
    let locations = [web.location.as_str(), api.location.as_str()];
    assert!(prefetcher.start_all(&env.root, locations, &env.cancel).is_err());
    prefetcher.wait(&api.location, &env.cancel).unwrap();

    assert_eq!(env.git.fetch_count(), 1);
}
