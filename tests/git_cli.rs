//! Stock git against the server. Skipped when `git` is not installed.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::net::TcpListener;
use wflib::{GitStorage, ListenerRegistry, PushGateway, StaticAccessControl, WflibServer};

async fn start_test_server(data_root: &Path, notified: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let accounts = Arc::new(StaticAccessControl::new().with_user("admin", "secret", true));
    let listeners = Arc::new(ListenerRegistry::new());
    let gateway = Arc::new(PushGateway::new(data_root, accounts.clone(), listeners.clone()));

    let root = gateway.resolve_repository_root();
    listeners.register(Arc::new(move || -> anyhow::Result<()> {
        let storage = GitStorage::open(&root)?;
        let head = storage.resolve_ref("refs/heads/master")?;
        notified.lock().push(head.to_hex());
        Ok(())
    }));

    let server = WflibServer::new(gateway, "127.0.0.1:0".into()).with_accounts(accounts);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    addr
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run git without a terminal, killing it after `timeout_secs`
fn run_git(args: &[&str], cwd: &Path, timeout_secs: u64) -> Output {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let start = Instant::now();
    loop {
        if child.try_wait().unwrap().is_some() {
            return child.wait_with_output().unwrap();
        }
        if start.elapsed() > Duration::from_secs(timeout_secs) {
            let _ = child.kill();
            panic!("git {:?} timed out after {}s", args, timeout_secs);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn git_ok(args: &[&str], cwd: &Path) -> String {
    let output = run_git(args, cwd, 30);
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_git_push_and_clone() {
    if !git_available() {
        eprintln!("git not available, skipping test");
        return;
    }

    let server_dir = tempdir().unwrap();
    let notified = Arc::new(Mutex::new(Vec::new()));
    let addr = start_test_server(server_dir.path(), notified.clone()).await;

    let local = tempdir().unwrap();
    let local = local.path();
    git_ok(&["init", "-q"], local);
    git_ok(&["config", "user.email", "dev@example.com"], local);
    git_ok(&["config", "user.name", "Dev"], local);
    std::fs::create_dir_all(local.join("vars")).unwrap();
    std::fs::write(local.join("vars/greet.groovy"), "def call(name) { echo \"hello ${name}\" }\n").unwrap();
    git_ok(&["add", "."], local);
    git_ok(&["commit", "-q", "-m", "Add greet step"], local);
    let head = git_ok(&["rev-parse", "HEAD"], local).trim().to_string();

    // anonymous push is refused and creates nothing
    let anonymous = format!("http://{}/workflowLibs.git", addr);
    let output = run_git(&["push", &anonymous, "HEAD:refs/heads/master"], local, 30);
    assert!(!output.status.success());
    assert!(!server_dir.path().join("workflow-libs").exists());

    let url = format!("http://admin:secret@{}/workflowLibs.git", addr);
    git_ok(&["push", &url, "HEAD:refs/heads/master"], local);
    assert_eq!(*notified.lock(), vec![head.clone()]);

    // stock git accepts what we wrote
    let repo = server_dir.path().join("workflow-libs");
    let fsck = run_git(&["--git-dir", repo.to_str().unwrap(), "fsck", "--strict"], server_dir.path(), 30);
    assert!(fsck.status.success(), "fsck: {}", String::from_utf8_lossy(&fsck.stderr));

    let clone_dir = tempdir().unwrap();
    git_ok(&["clone", "-q", &anonymous, "cloned"], clone_dir.path());
    let greet = std::fs::read_to_string(clone_dir.path().join("cloned/vars/greet.groovy")).unwrap();
    assert!(greet.contains("hello ${name}"));

    let remote = git_ok(&["ls-remote", &anonymous], clone_dir.path());
    assert!(remote.contains(&format!("{}\trefs/heads/master", head)), "{}", remote);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clone_and_fetch_with_many_refs() {
    if !git_available() {
        eprintln!("git not available, skipping test");
        return;
    }

    let server_dir = tempdir().unwrap();
    let notified = Arc::new(Mutex::new(Vec::new()));
    let addr = start_test_server(server_dir.path(), notified.clone()).await;
    let url = format!("http://admin:secret@{}/workflowLibs.git", addr);
    let anonymous = format!("http://{}/workflowLibs.git", addr);

    let local = tempdir().unwrap();
    let local = local.path();
    git_ok(&["init", "-q"], local);
    git_ok(&["config", "user.email", "dev@example.com"], local);
    git_ok(&["config", "user.name", "Dev"], local);

    // one distinct commit per branch, so a clone wants more than git's
    // 1 KiB gzip threshold
    let branches = 41;
    for i in 0..branches {
        git_ok(&["commit", "-q", "--allow-empty", "-m", &format!("release {}", i)], local);
        git_ok(&["branch", &format!("release-{}", i)], local);
    }
    git_ok(&["push", "-q", &url, "HEAD:refs/heads/master", "refs/heads/release-*:refs/heads/release-*"], local);

    let clone_dir = tempdir().unwrap();
    git_ok(&["clone", "-q", "--mirror", &anonymous, "mirror.git"], clone_dir.path());
    let mirror = clone_dir.path().join("mirror.git");
    let refs = git_ok(&["for-each-ref", "--format=%(refname)"], &mirror);
    assert_eq!(refs.lines().count(), branches + 1, "{}", refs);

    // incremental fetch advertises many haves
    git_ok(&["commit", "-q", "--allow-empty", "-m", "next"], local);
    let head = git_ok(&["rev-parse", "HEAD"], local).trim().to_string();
    git_ok(&["push", "-q", &url, "HEAD:refs/heads/master"], local);
    git_ok(&["fetch", "-q", &anonymous, "+refs/heads/*:refs/heads/*"], &mirror);
    let fetched = git_ok(&["rev-parse", "refs/heads/master"], &mirror);
    assert_eq!(fetched.trim(), head);
    assert_eq!(notified.lock().last(), Some(&head));
}
