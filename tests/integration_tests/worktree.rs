use crate::common::{TestEnv, env, run_git};
use gion::git::{GionError, NameKind};
use gion::store;
use gion::workspace::worktree::{self, AddRepo};
use gion::workspace::{self, Metadata, RemoveOptions};
use rstest::rstest;

fn create(env: &TestEnv, id: &str) {
    workspace::create(&env.root, id, &Metadata::default(), &env.cancel).unwrap();
}

#[rstest]
fn test_add_creates_branch_from_default(env: TestEnv) {
    let api = env.remote("api");
    create(&env, "PROJ-1");

    let added = env.add("PROJ-1", &api);

    assert!(added.created_branch);
    assert_eq!(added.base_ref.as_deref(), Some("origin/main"));
    assert_eq!(added.entry.alias, "api");
    assert_eq!(added.entry.branch, "PROJ-1");
    assert_eq!(added.entry.repo_key, "example.com/acme/api");
    assert_eq!(
        added.entry.worktree_path,
        env.root.dir().join("workspaces/PROJ-1/api")
    );
    assert_eq!(
        run_git(&added.entry.worktree_path, &["branch", "--show-current"]),
        "PROJ-1"
    );
    assert_eq!(
        run_git(&added.entry.worktree_path, &["rev-parse", "HEAD"]),
        run_git(&api.bare, &["rev-parse", "main"])
    );
}

#[rstest]
fn test_add_is_visible_to_scan(env: TestEnv) {
    let api = env.remote("api");
    create(&env, "PROJ-1");
    let added = env.add("PROJ-1", &api);

    let ws_dir = env.root.workspace_dir("PROJ-1");
    let (repos, warnings) = workspace::scan_repos(&env.root, &ws_dir, &env.cancel).unwrap();

    assert!(warnings.is_empty(), "{warnings:?}");
    assert_eq!(repos, vec![added.entry.clone()]);
    assert_eq!(
        repos[0].store_path.as_deref(),
        Some(env.root.dir().join("bare/example.com/acme/api.git").as_path())
    );
}

#[rstest]
fn test_add_with_alias_branch_and_base(env: TestEnv) {
    let api = env.remote("api");
    api.push_branch("release");
    create(&env, "PROJ-1");

    let added = worktree::add(
        &env.root,
        "PROJ-1",
        &AddRepo {
            alias: Some("backend".into()),
            branch: Some("fix/login".into()),
            base_ref: Some("origin/release".into()),
            ..AddRepo::new(&api.location)
        },
        &env.cancel,
    )
    .unwrap();

    assert_eq!(added.entry.alias, "backend");
    assert_eq!(added.entry.branch, "fix/login");
    assert_eq!(
        run_git(&added.entry.worktree_path, &["rev-parse", "HEAD"]),
        run_git(&api.bare, &["rev-parse", "release"])
    );
}

#[rstest]
fn test_add_rejects_duplicate_alias_and_identity(env: TestEnv) {
    let api = env.remote("api");
    let web = env.remote("web");
    create(&env, "PROJ-1");
    env.add("PROJ-1", &api);

    // Same identity under another alias
    let err = worktree::add(
        &env.root,
        "PROJ-1",
        &AddRepo {
            alias: Some("api2".into()),
            ..AddRepo::new(&api.location)
        },
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::AlreadyExists { what: "repo", .. })
    ));

    // Different identity under a taken alias
    let err = worktree::add(
        &env.root,
        "PROJ-1",
        &AddRepo {
            alias: Some("api".into()),
            ..AddRepo::new(&web.location)
        },
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::AlreadyExists { what: "alias", .. })
    ));

    // Rejected before anything touched the web store
    assert!(!store::exists(&env.root, &web.location).unwrap().1);
}

#[rstest]
fn test_add_validates_before_mutating(env: TestEnv) {
    let api = env.remote("api");

    let err = worktree::add(&env.root, "missing", &AddRepo::new(&api.location), &env.cancel)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::NotFound { what: "workspace", .. })
    ));

    create(&env, "PROJ-1");
    let err = worktree::add(
        &env.root,
        "PROJ-1",
        &AddRepo {
            branch: Some("bad..branch".into()),
            ..AddRepo::new(&api.location)
        },
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::InvalidName {
            kind: NameKind::Branch,
            ..
        })
    ));

    assert!(!store::exists(&env.root, &api.location).unwrap().1);
    assert_eq!(env.git.fetch_count(), 0);
}

#[rstest]
fn test_add_attaches_existing_local_branch(env: TestEnv) {
    let api = env.remote("api");
    create(&env, "PROJ-1");

    // Store syncs prune every head except the default branch, so that is
    // the one left to attach.
    let added = worktree::add(
        &env.root,
        "PROJ-1",
        &AddRepo {
            branch: Some("main".into()),
            ..AddRepo::new(&api.location)
        },
        &env.cancel,
    )
    .unwrap();

    assert!(!added.created_branch);
    assert_eq!(added.base_ref, None);
    assert_eq!(
        run_git(&added.entry.worktree_path, &["branch", "--show-current"]),
        "main"
    );
}

#[rstest]
fn test_add_tracking(env: TestEnv) {
    let api = env.remote("api");
    api.push_branch("feature");
    create(&env, "PR-1");

    let added = worktree::add_tracking(
        &env.root,
        "PR-1",
        &api.location,
        None,
        "feature",
        "origin/feature",
        &env.cancel,
    )
    .unwrap();

    assert_eq!(added.entry.branch, "feature");
    let upstream = run_git(
        &added.entry.worktree_path,
        &["rev-parse", "--abbrev-ref", "feature@{upstream}"],
    );
    assert_eq!(upstream, "origin/feature");
}

#[rstest]
fn test_add_tracking_rejects_missing_and_non_remote_refs(env: TestEnv) {
    let api = env.remote("api");
    create(&env, "PR-1");

    let err = worktree::add_tracking(
        &env.root,
        "PR-1",
        &api.location,
        None,
        "feature",
        "feature",
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::InvalidName { .. })
    ));

    let err = worktree::add_tracking(
        &env.root,
        "PR-1",
        &api.location,
        None,
        "feature",
        "origin/nope",
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::NotFound { what: "ref", .. })
    ));
    assert!(!env.root.worktree_path("PR-1", "api").exists());
}

#[rstest]
fn test_remove_repo_gates_on_dirty(env: TestEnv) {
    let api = env.remote("api");
    create(&env, "PROJ-1");
    let added = env.add("PROJ-1", &api);
    std::fs::write(added.entry.worktree_path.join("scratch.txt"), "wip").unwrap();

    let err = worktree::remove_repo(
        &env.root,
        "PROJ-1",
        "api",
        RemoveOptions::default(),
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::DirtyWorkingTree { alias }) if alias == "api"
    ));
    assert!(added.entry.worktree_path.exists());

    worktree::remove_repo(
        &env.root,
        "PROJ-1",
        "api",
        RemoveOptions {
            allow_dirty: true,
            ..Default::default()
        },
        &env.cancel,
    )
    .unwrap();
    assert!(!added.entry.worktree_path.exists());
}

#[rstest]
fn test_remove_repo_unknown_alias(env: TestEnv) {
    create(&env, "PROJ-1");
    let err = worktree::remove_repo(
        &env.root,
        "PROJ-1",
        "api",
        RemoveOptions::default(),
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::NotFound { what: "alias", .. })
    ));
}

#[rstest]
fn test_remove_repo_without_store(env: TestEnv) {
    create(&env, "PROJ-1");
    let plain = env.root.workspace_dir("PROJ-1").join("plain");
    std::fs::create_dir(&plain).unwrap();
    run_git(&plain, &["init", "--quiet"]);

    let err = worktree::remove_repo(
        &env.root,
        "PROJ-1",
        "plain",
        RemoveOptions {
            allow_status_error: true,
            ..Default::default()
        },
        &env.cancel,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::NotFound { what: "repo store", name }) if name == "PROJ-1/plain"
    ));
    assert!(plain.exists());
}

#[rstest]
fn test_rename_branch(env: TestEnv) {
    let api = env.remote("api");
    create(&env, "PROJ-1");
    let added = env.add("PROJ-1", &api);

    let err = worktree::rename_branch(&env.root, "PROJ-1", "api", "other", "next", &env.cancel)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::InvalidName { kind: NameKind::Branch, name, .. }) if name == "other"
    ));

    let entry =
        worktree::rename_branch(&env.root, "PROJ-1", "api", "PROJ-1", "next", &env.cancel).unwrap();
    assert_eq!(entry.branch, "next");
    assert_eq!(
        run_git(&added.entry.worktree_path, &["branch", "--show-current"]),
        "next"
    );
}

#[rstest]
fn test_resolve_base_ref_falls_back_to_local_main(env: TestEnv) {
    let api = env.remote("api");
    let store = store::get(&env.root, &api.location, &env.cancel).unwrap();
    let repo = store.repository(&env.root, &env.cancel);

    assert_eq!(worktree::resolve_base_ref(&repo).unwrap(), "origin/main");

    // Without origin/HEAD the store's own HEAD target wins
    run_git(&store.store_path, &["symbolic-ref", "--delete", "refs/remotes/origin/HEAD"]);
    assert_eq!(worktree::resolve_base_ref(&repo).unwrap(), "refs/heads/main");

    // HEAD pointing at nothing falls through to the remote-tracking candidates
    run_git(&store.store_path, &["symbolic-ref", "HEAD", "refs/heads/gone"]);
    run_git(&store.store_path, &["update-ref", "-d", "refs/heads/main"]);
    assert_eq!(worktree::resolve_base_ref(&repo).unwrap(), "origin/main");

    run_git(&store.store_path, &["update-ref", "-d", "refs/remotes/origin/main"]);
    let err = worktree::resolve_base_ref(&repo).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GionError>(),
        Some(GionError::BaseRefNotFound { .. })
    ));
}
