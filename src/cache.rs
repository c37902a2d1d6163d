//! Reference Cache: a content-addressed, on-disk cache of bare mirror
//! repositories with two-level locking (inter-process file lock +
//! intra-process mutex), per-run freshness tracking, and self-healing
//! eviction on corruption.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};

use crate::classify;
use crate::error::{Error, Result};
use crate::exec::{self, CommandSpec};
use crate::urlkey;

pub struct CacheOptions {
    pub lock_timeout: Duration,
    pub pre_clone_hook: Option<Utf8PathBuf>,
    pub prefetch_enabled: bool,
    pub verbose: bool,
    pub print_on_failure: bool,
    /// Environment overlay applied to every `git` invocation the cache
    /// makes (mirror clone, `remote update --prune`, pre-clone hook).
    /// Unset by default; tests use it to point `PATH` at a stub `git`.
    pub git_env: Option<HashMap<String, String>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            pre_clone_hook: None,
            prefetch_enabled: true,
            verbose: false,
            print_on_failure: false,
            git_env: None,
        }
    }
}

/// Process-wide, content-addressed cache of bare mirrors under `root`.
pub struct Cache {
    root: Utf8PathBuf,
    freshness: Mutex<HashMap<String, bool>>,
    mutexes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    opts: CacheOptions,
}

impl Cache {
    pub fn new(root: Utf8PathBuf, opts: CacheOptions) -> Result<Arc<Self>> {
        fs::create_dir_all(&root)?;
        Ok(Arc::new(Self {
            root,
            freshness: Mutex::new(HashMap::new()),
            mutexes: Mutex::new(HashMap::new()),
            opts,
        }))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.mutexes.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn open_lock_file(&self, url: &str, local: bool) -> Result<fd_lock::RwLock<File>> {
        let path = urlkey::lock_file_path(&self.root, url, local);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        Ok(fd_lock::RwLock::new(options.open(&path)?))
    }

    fn acquire_file_lock<'a>(
        &self,
        key: &str,
        lock: &'a mut fd_lock::RwLock<File>,
    ) -> Result<fd_lock::RwLockWriteGuard<'a, File>> {
        if self.opts.lock_timeout.is_zero() {
            return Ok(lock.write()?);
        }
        let start = Instant::now();
        loop {
            match lock.try_write() {
                Ok(guard) => return Ok(guard),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= self.opts.lock_timeout {
                        return Err(Error::LockTimeout {
                            key: key.to_string(),
                            secs: self.opts.lock_timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn exec(&self, argv: Vec<String>, cwd: Option<&Utf8Path>) -> Result<String> {
        let mut spec = CommandSpec::new(argv)
            .quiet(!self.opts.verbose)
            .print_on_failure(self.opts.print_on_failure);
        if let Some(cwd) = cwd {
            spec = spec.cwd(cwd);
        }
        if let Some(env) = self.opts.git_env.as_ref() {
            spec = spec.env(env);
        }
        Ok(exec::run(&spec)?)
    }

    /// Ensures the mirror for `url` is present and fresh, then invokes
    /// `body(mirror_dir, attempt_number)` while holding the per-URL
    /// intra-process mutex. A retriable failure from `body` evicts the
    /// mirror and retries once (attempt_number becomes 1); a second
    /// retriable failure is surfaced to the caller.
    pub fn with_mirror<T>(
        self: &Arc<Self>,
        url: &str,
        local: bool,
        mut body: impl FnMut(&Utf8Path, u32) -> Result<T>,
    ) -> Result<T> {
        let key = urlkey::key(url, local);
        let mirror_dir = self.root.join(&key);
        let mut attempt = 0u32;
        loop {
            self.update(url, local, true)?;

            let mutex = self.mutex_for(&key);
            let guard = mutex.lock().unwrap();
            match body(&mirror_dir, attempt) {
                Ok(value) => return Ok(value),
                Err(Error::Exec(e)) if attempt == 0 && classify::retriable(&e.output) => {
                    println!("git-fastclone: retrying {url} after corrupted cache:");
                    for line in e.output.lines() {
                        println!("    {line}");
                    }
                    self.evict(url, local);
                    attempt = 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The freshness path: ensure `url`'s mirror is up to date, acquiring
    /// the file lock then the intra-process mutex, in that order, to
    /// match the order other processes take the same locks in.
    /// Launches unjoined prefetch workers for any known submodule URLs
    /// before (re-)running `store_updated`.
    pub fn update(self: &Arc<Self>, url: &str, local: bool, fail_hard: bool) -> Result<()> {
        let key = urlkey::key(url, local);
        let mirror_dir = self.root.join(&key);

        let mut file_lock = self.open_lock_file(url, local)?;
        let _file_guard = self.acquire_file_lock(&key, &mut file_lock)?;
        let mutex = self.mutex_for(&key);
        let _guard = mutex.lock().unwrap();

        if self.opts.prefetch_enabled {
            self.spawn_prefetch(url, local);
        }

        let already_fresh = *self.freshness.lock().unwrap().get(&key).unwrap_or(&false);
        if !already_fresh {
            self.store_updated(url, &mirror_dir, &key, local, fail_hard, 0)?;
        }
        Ok(())
    }

    fn spawn_prefetch(self: &Arc<Self>, url: &str, local: bool) {
        let submodules_path = urlkey::submodules_file(&self.root, url, local);
        let Ok(contents) = fs::read_to_string(&submodules_path) else {
            return;
        };
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let cache = Arc::clone(self);
            let sub_url = line.to_string();
            thread::spawn(move || {
                if let Err(e) = cache.update(&sub_url, false, false) {
                    eprintln!("git-fastclone: prefetch warm-up failed for {sub_url}: {e}");
                }
            });
        }
    }

    /// Invokes the pre-clone hook (if configured and the mirror is
    /// absent), clones the mirror if still absent, then runs
    /// `remote update --prune`. On a non-authentication failure the
    /// mirror is evicted; `fail_hard` controls whether the failure is
    /// re-raised or swallowed.
    fn store_updated(
        &self,
        url: &str,
        mirror: &Utf8Path,
        key: &str,
        local: bool,
        fail_hard: bool,
        attempt: u32,
    ) -> Result<()> {
        if let Some(hook) = self.opts.pre_clone_hook.clone() {
            if !mirror.exists() {
                self.exec(
                    vec![
                        hook.to_string(),
                        url.to_string(),
                        mirror.to_string(),
                        attempt.to_string(),
                    ],
                    None,
                )?;
            }
        }

        if !mirror.exists() {
            if let Some(parent) = mirror.parent() {
                fs::create_dir_all(parent)?;
            }
            println!("git-fastclone: mirroring {url}...");
            self.exec(
                vec![
                    "git".into(),
                    "clone".into(),
                    "--mirror".into(),
                    "--".into(),
                    url.to_string(),
                    mirror.to_string(),
                ],
                None,
            )?;
        }

        match self.exec(
            vec![
                "git".into(),
                "remote".into(),
                "update".into(),
                "--prune".into(),
            ],
            Some(mirror),
        ) {
            Ok(_) => {
                self.freshness.lock().unwrap().insert(key.to_string(), true);
                Ok(())
            }
            Err(Error::Exec(e)) => {
                if !classify::auth_error(&e.output) {
                    self.evict(url, local);
                }
                if fail_hard {
                    Err(Error::Exec(e))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Removes the mirror directory and clears its freshness entry.
    /// Subsequent callers re-clone from scratch.
    fn evict(&self, url: &str, local: bool) {
        let key = urlkey::key(url, local);
        let mirror = self.root.join(&key);
        let _ = fs::remove_dir_all(&mirror);
        self.freshness.lock().unwrap().remove(&key);
    }

    /// Persists the last-known direct submodule URLs of `url`'s mirror,
    /// under `url`'s own file+mutex lock, for future prefetch warm-up.
    pub fn update_submodule_list(self: &Arc<Self>, url: &str, local: bool, urls: &[String]) -> Result<()> {
        let key = urlkey::key(url, local);
        let mut file_lock = self.open_lock_file(url, local)?;
        let _file_guard = self.acquire_file_lock(&key, &mut file_lock)?;
        let mutex = self.mutex_for(&key);
        let _guard = mutex.lock().unwrap();

        let path = urlkey::submodules_file(&self.root, url, local);
        let mut contents = urls.join("\n");
        if !urls.is_empty() {
            contents.push('\n');
        }
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn init_bare_source(dir: &std::path::Path) {
        assert!(Command::new("git")
            .args(["init", "--quiet"])
            .current_dir(dir)
            .status()
            .unwrap()
            .success());
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        assert!(Command::new("git")
            .args(["add", "README.md"])
            .current_dir(dir)
            .status()
            .unwrap()
            .success());
        assert!(Command::new("git")
            .args([
                "-c",
                "user.email=test@example.com",
                "-c",
                "user.name=test",
                "commit",
                "-q",
                "-m",
                "init",
            ])
            .current_dir(dir)
            .status()
            .unwrap()
            .success());
    }

    #[test]
    fn with_mirror_runs_update_prune_once_per_process() {
        let src = tempdir().unwrap();
        init_bare_source(src.path());

        let root = tempdir().unwrap();
        let cache = Cache::new(
            Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap(),
            CacheOptions {
                prefetch_enabled: false,
                ..Default::default()
            },
        )
        .unwrap();

        let url = src.path().to_string_lossy().to_string();
        for _ in 0..2 {
            cache
                .with_mirror(&url, true, |_mirror, _attempt| Ok(()))
                .unwrap();
        }
        let key = urlkey::key(&url, true);
        assert_eq!(cache.freshness.lock().unwrap().get(&key), Some(&true));
        assert!(root.path().join(&key).join("HEAD").exists());
    }

    #[test]
    fn evict_removes_mirror_and_freshness_entry() {
        let src = tempdir().unwrap();
        init_bare_source(src.path());

        let root = tempdir().unwrap();
        let cache = Cache::new(
            Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap(),
            CacheOptions {
                prefetch_enabled: false,
                ..Default::default()
            },
        )
        .unwrap();

        let url = src.path().to_string_lossy().to_string();
        cache.update(&url, true, true).unwrap();
        let key = urlkey::key(&url, true);
        assert!(root.path().join(&key).exists());

        cache.evict(&url, true);
        assert!(!root.path().join(&key).exists());
        assert!(cache.freshness.lock().unwrap().get(&key).is_none());
    }

    #[test]
    fn with_mirror_evicts_and_retries_once_on_retriable_body_failure() {
        let src = tempdir().unwrap();
        init_bare_source(src.path());

        let root = tempdir().unwrap();
        let cache = Cache::new(
            Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap(),
            CacheOptions {
                prefetch_enabled: false,
                ..Default::default()
            },
        )
        .unwrap();

        let url = src.path().to_string_lossy().to_string();
        let key = urlkey::key(&url, true);

        // Populate the mirror once so eviction has something to remove.
        cache.update(&url, true, true).unwrap();
        assert!(root.path().join(&key).exists());

        let attempts: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        cache
            .with_mirror(&url, true, |_mirror, attempt| {
                attempts.lock().unwrap().push(attempt);
                if attempt == 0 {
                    Err(Error::Exec(exec::ExecutionError {
                        status: exec::ExitStatusKind::Code(1),
                        argv: vec!["git".to_string()],
                        output: "fatal: pack has 1 unresolved delta\n".to_string(),
                    }))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(*attempts.lock().unwrap(), vec![0, 1]);
        // The eviction removed the mirror; with_mirror's second `update()`
        // call re-cloned it before invoking body with attempt = 1.
        assert!(root.path().join(&key).exists());
    }

    #[test]
    fn with_mirror_surfaces_a_second_consecutive_retriable_failure() {
        let src = tempdir().unwrap();
        init_bare_source(src.path());

        let root = tempdir().unwrap();
        let cache = Cache::new(
            Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap(),
            CacheOptions {
                prefetch_enabled: false,
                ..Default::default()
            },
        )
        .unwrap();

        let url = src.path().to_string_lossy().to_string();
        let err = cache
            .with_mirror(&url, true, |_mirror, _attempt| {
                Err(Error::Exec(exec::ExecutionError {
                    status: exec::ExitStatusKind::Code(1),
                    argv: vec!["git".to_string()],
                    output: "fatal: pack has 1 unresolved delta\n".to_string(),
                }))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Exec(_)));
    }

    #[cfg(unix)]
    fn real_git_path() -> String {
        String::from_utf8(
            Command::new("sh")
                .args(["-c", "command -v git"])
                .output()
                .unwrap()
                .stdout,
        )
        .unwrap()
        .trim()
        .to_string()
    }

    /// A stub `git` that fails `remote update --prune` with an
    /// authentication error and otherwise delegates to the real `git`,
    /// so the mirror clone step still works for real.
    #[cfg(unix)]
    fn install_auth_failing_git_stub(dir: &std::path::Path) -> HashMap<String, String> {
        const SCRIPT: &str = "#!/bin/sh\nif [ \"$1\" = remote ] && [ \"$2\" = update ]; then\n  echo \"fatal: Authentication failed for 'https://example.com/repo.git'\" >&2\n  exit 1\nfi\nexec \"$REAL_GIT\" \"$@\"\n";
        let stub = dir.join("git");
        fs::write(&stub, SCRIPT).unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();

        let path = format!("{}:{}", dir.display(), std::env::var("PATH").unwrap_or_default());
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), path);
        env.insert("REAL_GIT".to_string(), real_git_path());
        env
    }

    #[test]
    #[cfg(unix)]
    fn store_updated_does_not_evict_on_authentication_failure() {
        let src = tempdir().unwrap();
        init_bare_source(src.path());

        let stub_dir = tempdir().unwrap();
        let git_env = install_auth_failing_git_stub(stub_dir.path());

        let root = tempdir().unwrap();
        let cache = Cache::new(
            Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap(),
            CacheOptions {
                prefetch_enabled: false,
                git_env: Some(git_env),
                ..Default::default()
            },
        )
        .unwrap();

        let url = src.path().to_string_lossy().to_string();
        let key = urlkey::key(&url, true);

        let err = cache.update(&url, true, true).unwrap_err();
        assert!(matches!(err, Error::Exec(_)));
        // The mirror was cloned (via the stub's passthrough to real git)
        // but `remote update --prune`'s auth failure must not evict it.
        assert!(root.path().join(&key).exists());
        assert!(cache.freshness.lock().unwrap().get(&key).is_none());
    }
}
