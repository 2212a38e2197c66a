//! Sandbox protocol tests
//!
//! End-to-end runs of the generated commands through a local shell sandbox. These need
//! `node` on PATH and are skipped (with a note on stderr) when it is missing.

use std::sync::Arc;

use deepagents_sandbox::backends::{
    CompositeBackend, LocalShellConfig, LocalShellSandbox, StoreBackend,
};
use deepagents_sandbox::tools::{
    is_sandbox_backend, EditResult, FileBackend, FileOperationError, InMemoryStore,
    SandboxBackend, DEFAULT_READ_LIMIT, DEFAULT_READ_OFFSET,
};

fn node_available() -> bool {
    std::process::Command::new("node")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// A sandbox rooted in a fresh temp dir, or `None` when node is unavailable.
fn sandbox() -> Option<(tempfile::TempDir, LocalShellSandbox, String)> {
    let _ = env_logger::builder().is_test(true).try_init();
    if !node_available() {
        eprintln!("skipping: node is not on PATH");
        return None;
    }
    let dir = tempfile::tempdir().unwrap();
    let sandbox = LocalShellSandbox::new(LocalShellConfig::new(dir.path())).unwrap();
    let root = sandbox.working_directory().to_string_lossy().into_owned();
    Some((dir, sandbox, root))
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    let path = format!("{}/notes/today.txt", root);

    let res = backend.write(&path, "hello\nworld\n").await.unwrap();
    assert_eq!(res.path(), Some(path.as_str()));
    assert!(res.files_update().is_none());

    let text = backend
        .read(&path, DEFAULT_READ_OFFSET, DEFAULT_READ_LIMIT)
        .await
        .unwrap();
    assert_eq!(text, "     1\thello\n     2\tworld");

    let text = backend.read(&path, 1, 1).await.unwrap();
    assert_eq!(text, "     2\tworld");
}

#[tokio::test]
async fn test_write_never_overwrites() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    let path = format!("{}/a.txt", root);

    assert!(backend.write(&path, "first").await.unwrap().is_ok());
    let res = backend.write(&path, "second").await.unwrap();
    assert_eq!(
        res.error(),
        Some(
            format!(
                "Cannot write to {} because it already exists. Read and then make an edit, or write to a new path.",
                path
            )
            .as_str()
        )
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");
}

#[tokio::test]
async fn test_hostile_content_survives_unchanged() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    let path = format!("{}/it's \"odd\" $(name).txt", root);
    let content = "quote ' double \" dollar $(rm -rf /) `tick` \\n back\\slash\nünïcødé 🚀\n";

    assert!(backend.write(&path, content).await.unwrap().is_ok());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), content);

    let downloaded = backend.download_files(&[path.clone()]).await.unwrap();
    assert_eq!(downloaded[0].error, None);
    assert_eq!(downloaded[0].content.as_deref(), Some(content.as_bytes()));
}

#[tokio::test]
async fn test_edit_scenario() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    let path = format!("{}/a.txt", root);
    backend.write(&path, "hello\nhello\n").await.unwrap();

    let res = backend.edit(&path, "hello", "hi", false).await.unwrap();
    assert!(matches!(res, EditResult::MultipleOccurrences { .. }));
    assert_eq!(
        res.error().unwrap(),
        format!(
            "Multiple occurrences found in '{}'. Use replace_all=true to replace all.",
            path
        )
    );

    let res = backend.edit(&path, "hello", "hi", true).await.unwrap();
    assert_eq!(res.occurrences(), Some(2));
    assert_eq!(res.path(), Some(path.as_str()));

    let text = backend.read(&path, 0, DEFAULT_READ_LIMIT).await.unwrap();
    assert_eq!(text, "     1\thi\n     2\thi");

    // replacing again finds nothing
    let res = backend.edit(&path, "hello", "hi", true).await.unwrap();
    assert!(matches!(res, EditResult::StringNotFound { .. }));

    let res = backend.edit(&path, "hi\nhi", "bye", false).await.unwrap();
    assert_eq!(res.occurrences(), Some(1));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "bye\n");
}

#[tokio::test]
async fn test_missing_and_empty_files() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    let missing = format!("{}/missing.txt", root);
    let empty = format!("{}/empty.txt", root);
    std::fs::write(&empty, "").unwrap();

    assert_eq!(
        backend.read(&missing, 0, 10).await.unwrap(),
        format!("Error: File '{}' not found", missing)
    );
    assert_eq!(
        backend.read(&empty, 0, 10).await.unwrap(),
        "System reminder: File exists but has empty contents"
    );

    let res = backend.edit(&missing, "a", "b", false).await.unwrap();
    assert!(matches!(res, EditResult::FileNotFound { .. }));
}

#[tokio::test]
async fn test_ls_glob_and_grep() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    std::fs::create_dir_all(format!("{}/src/nested", root)).unwrap();
    std::fs::write(format!("{}/src/lib.rs", root), "pub fn a() {}\n// TODO later\n").unwrap();
    std::fs::write(format!("{}/src/nested/mod.rs", root), "fn b() {}\n").unwrap();
    std::fs::write(format!("{}/README.md", root), "TODO: docs\n").unwrap();
    std::fs::create_dir_all(format!("{}/empty", root)).unwrap();

    let mut listed: Vec<(String, Option<bool>)> = backend
        .ls_info(&format!("{}/src", root))
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.path, f.is_dir))
        .collect();
    listed.sort();
    assert_eq!(
        listed,
        vec![
            (format!("{}/src/lib.rs", root), Some(false)),
            (format!("{}/src/nested/", root), Some(true)),
        ]
    );
    assert!(backend
        .ls_info(&format!("{}/nope", root))
        .await
        .unwrap()
        .is_empty());

    let mut found: Vec<String> = backend
        .glob_info("**/*.rs", &root)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    found.sort();
    assert_eq!(
        found,
        vec![
            format!("{}/src/lib.rs", root),
            format!("{}/src/nested/mod.rs", root),
        ]
    );
    let top: Vec<String> = backend
        .glob_info("*.rs", &format!("{}/src", root))
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(top, vec![format!("{}/src/lib.rs", root)]);
    assert!(backend
        .glob_info("*", &format!("{}/empty", root))
        .await
        .unwrap()
        .is_empty());

    let out = backend.grep_raw("TODO", Some(&root), None).await.unwrap();
    let mut hits: Vec<(String, u64)> = out
        .matches()
        .unwrap()
        .iter()
        .map(|m| (m.path.clone(), m.line))
        .collect();
    hits.sort();
    assert_eq!(
        hits,
        vec![
            (format!("{}/README.md", root), 1),
            (format!("{}/src/lib.rs", root), 2),
        ]
    );

    let out = backend
        .grep_raw("TODO", Some(&root), Some("**/*.md"))
        .await
        .unwrap();
    assert_eq!(out.matches().unwrap().len(), 1);
    assert_eq!(out.matches().unwrap()[0].text, "TODO: docs");

    let out = backend.grep_raw("(", Some(&root), None).await.unwrap();
    assert!(out.error().unwrap().starts_with("Invalid regex:"));
}

#[tokio::test]
async fn test_upload_partial_success() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;

    let res = backend
        .upload_files(vec![
            ("in/a.txt".to_string(), b"alpha\n".to_vec()),
            ("../outside.txt".to_string(), b"nope".to_vec()),
        ])
        .await
        .unwrap();
    assert_eq!(res.len(), 2);
    assert_eq!(res[0].error, None);
    assert_eq!(res[1].error, Some(FileOperationError::InvalidPath));

    let text = backend
        .read(&format!("{}/in/a.txt", root), 0, DEFAULT_READ_LIMIT)
        .await
        .unwrap();
    assert_eq!(text, "     1\talpha");
}

#[tokio::test]
async fn test_composite_routes_memories_to_store() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let composite = CompositeBackend::new(Arc::new(sandbox)).with_route(
        "/memories/",
        Arc::new(StoreBackend::new(Arc::new(InMemoryStore::new()))),
    );
    assert!(is_sandbox_backend(&composite));

    let res = composite
        .write("/memories/prefs.md", "likes tea")
        .await
        .unwrap();
    assert!(res.files_update().is_some());

    let on_disk = format!("{}/plain.txt", root);
    let res = composite.write(&on_disk, "x").await.unwrap();
    assert!(res.files_update().is_none());

    let sandbox = composite.as_sandbox().unwrap();
    let out = sandbox.execute("cat plain.txt").await.unwrap();
    assert_eq!(out.output, "x");
    assert_eq!(out.exit_code, Some(0));
}

#[tokio::test]
async fn test_search_skips_unreadable_entries() {
    use std::os::unix::fs::{symlink, PermissionsExt};

    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    std::fs::write(format!("{}/good.txt", root), "needle\n").unwrap();
    symlink(
        format!("{}/gone.txt", root),
        format!("{}/dangling.txt", root),
    )
    .unwrap();
    let locked = format!("{}/locked", root);
    std::fs::create_dir_all(&locked).unwrap();
    std::fs::write(format!("{}/hidden.txt", locked), "needle\n").unwrap();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
    // privileged users read through mode 000
    let locked_out = std::fs::read_dir(&locked).is_err();

    let out = backend.grep_raw("needle", Some(&root), None).await.unwrap();
    let hits: Vec<String> = out
        .matches()
        .unwrap()
        .iter()
        .map(|m| m.path.clone())
        .collect();
    assert!(hits.contains(&format!("{}/good.txt", root)));
    assert!(!hits.iter().any(|p| p.ends_with("dangling.txt")));
    if locked_out {
        assert_eq!(hits, vec![format!("{}/good.txt", root)]);
    }

    let found: Vec<String> = backend
        .glob_info("**/*.txt", &root)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert!(found.contains(&format!("{}/good.txt", root)));
    assert!(!found.iter().any(|p| p.ends_with("dangling.txt")));
    if locked_out {
        assert_eq!(found, vec![format!("{}/good.txt", root)]);
    }

    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_oversized_commands_are_not_outcomes() {
    let Some((_dir, sandbox, root)) = sandbox() else {
        return;
    };
    let backend: &dyn FileBackend = &sandbox;
    let big = format!("{}/big.txt", root);

    // far past the per-argument limit, so the shell cannot start node at all
    let res = backend.write(&big, &"x".repeat(200_000)).await.unwrap();
    assert!(!res.error().unwrap().contains("already exists"));
    assert!(!std::path::Path::new(&big).exists());

    let missing = format!("{}/none.txt", root);
    let res = backend
        .edit(&missing, &"o".repeat(200_000), "y", false)
        .await
        .unwrap();
    assert!(matches!(res, EditResult::Unknown { .. }));
}
