//! `git-fastclone` — a recursive repository checkout accelerator.
//!
//! Maintains a process-wide, on-disk cache of bare mirror repositories
//! (see [`cache`]) and fetches submodules concurrently (see [`fetch`]),
//! orchestrated by [`GitFastClone`], which validates inputs, sets the
//! protocol allow-list, and drives the fetch engine. The [`clone`]
//! free function is a convenience wrapper around it for one-shot
//! callers.

pub mod cache;
pub mod classify;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod urlkey;

pub use cache::{Cache, CacheOptions};
pub use error::{Error, Result};
pub use fetch::Engine;

use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;

pub const DEFAULT_ALLOWED_PROTOCOLS: &str = "file:git:http:https:ssh";

/// Options for a single top-level [`clone`] invocation.
pub struct Options {
    pub cache_root: Utf8PathBuf,
    pub branch: Option<String>,
    pub verbose: bool,
    pub print_on_failure: bool,
    pub config: Option<Vec<String>>,
    pub lock_timeout: Duration,
    pub pre_clone_hook: Option<Utf8PathBuf>,
    pub sparse_paths: Option<Vec<String>>,
    pub jobs: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            branch: None,
            verbose: false,
            print_on_failure: false,
            config: None,
            lock_timeout: Duration::ZERO,
            pre_clone_hook: None,
            sparse_paths: None,
            jobs: None,
        }
    }
}

/// `REFERENCE_REPO_DIR`, if set, else a platform-appropriate temp
/// location shared across the operator's invocations.
pub fn default_cache_root() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("REFERENCE_REPO_DIR") {
        return Utf8PathBuf::from(shellexpand::tilde(&dir).into_owned());
    }
    Utf8PathBuf::from_path_buf(std::env::temp_dir().join("git-fastclone").join("reference"))
        .expect("platform temp directory must be valid UTF-8")
}

/// Top-level orchestrator: the public entry point of the crate.
///
/// Holds a single invocation's [`Options`] and drives the [`Engine`]
/// against the [`Cache`], validating inputs and setting the protocol
/// allow-list before anything is spawned.
pub struct GitFastClone {
    opts: Options,
}

impl GitFastClone {
    pub fn new(opts: Options) -> Self {
        Self { opts }
    }

    /// Validates the request, sets `GIT_ALLOW_PROTOCOL` if the caller
    /// hasn't, and drives the fetch engine. Returns the destination
    /// path that was cloned into.
    pub fn clone(&self, url: &str, dest: Option<&Utf8PathBuf>) -> Result<Utf8PathBuf> {
        let opts = &self.opts;
        if opts.sparse_paths.is_some() && opts.branch.is_none() {
            return Err(Error::Usage(
                "sparse checkout requires an explicit --branch".to_string(),
            ));
        }

        let dest = match dest {
            Some(d) => d.clone(),
            None => Utf8PathBuf::from(urlkey::default_destination(url)),
        };

        let local = urlkey::is_local(url);

        if std::env::var_os("GIT_ALLOW_PROTOCOL").is_none() {
            std::env::set_var("GIT_ALLOW_PROTOCOL", DEFAULT_ALLOWED_PROTOCOLS);
        }

        fs::create_dir_all(&opts.cache_root)?;
        let cache = Cache::new(
            opts.cache_root.clone(),
            CacheOptions {
                lock_timeout: opts.lock_timeout,
                pre_clone_hook: opts.pre_clone_hook.clone(),
                prefetch_enabled: true,
                verbose: opts.verbose,
                print_on_failure: opts.print_on_failure,
                git_env: None,
            },
        )?;

        let jobs = opts.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let engine = Engine::new(cache, jobs, opts.verbose, opts.print_on_failure);

        engine.clone_repo(
            url,
            local,
            opts.branch.as_deref(),
            &dest,
            opts.sparse_paths.as_deref(),
            opts.config.as_deref(),
        )?;

        Ok(dest)
    }
}

/// Convenience wrapper around [`GitFastClone::new`]/[`GitFastClone::clone`]
/// for one-shot callers that don't need to hold onto the orchestrator.
pub fn clone(url: &str, dest: Option<&Utf8PathBuf>, opts: Options) -> Result<Utf8PathBuf> {
    GitFastClone::new(opts).clone(url, dest)
}
