//! Fetch Engine: drives `clone`, `submodule init` and recursion, and
//! dispatches a concurrent worker per discovered submodule.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use camino::Utf8Path;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::exec::CommandSpec;
use crate::urlkey;

static RAYON_CONFIGURED: AtomicBool = AtomicBool::new(false);

pub struct Engine {
    cache: Arc<Cache>,
    verbose: bool,
    print_on_failure: bool,
}

trait ClonableDestination {
    fn is_clone_target(&self) -> std::io::Result<bool>;
}

impl ClonableDestination for Utf8Path {
    fn is_clone_target(&self) -> std::io::Result<bool> {
        Ok(!self.exists() || (self.is_dir() && self.read_dir()?.next().is_none()))
    }
}

impl Engine {
    pub fn new(cache: Arc<Cache>, jobs: usize, verbose: bool, print_on_failure: bool) -> Arc<Self> {
        if jobs > 0 && !RAYON_CONFIGURED.swap(true, Ordering::AcqRel) {
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .build_global();
        }
        Arc::new(Self {
            cache,
            verbose,
            print_on_failure,
        })
    }

    fn exec(&self, argv: Vec<String>) -> Result<String> {
        let spec = CommandSpec::new(argv)
            .quiet(!self.verbose)
            .print_on_failure(self.print_on_failure);
        Ok(crate::exec::run(&spec)?)
    }

    fn exec_in(&self, dir: &Utf8Path, argv: Vec<String>) -> Result<String> {
        let spec = CommandSpec::new(argv)
            .cwd(dir)
            .quiet(!self.verbose)
            .print_on_failure(self.print_on_failure);
        Ok(crate::exec::run(&spec)?)
    }

    /// Clones `url` into `dest`, reusing the cache's mirror, checks out
    /// `rev` if given, and recurses into submodules.
    ///
    /// Note: in sparse mode the checkout clones straight from the mirror
    /// (the remote URL is never passed to `git clone`, since the mirror
    /// already holds every object), so the resulting checkout's `origin`
    /// remote points at the mirror path, not at `url`. Callers that need
    /// `origin` to reference the source URL must `remote set-url` it
    /// themselves afterward.
    pub fn clone_repo(
        self: &Arc<Self>,
        url: &str,
        local: bool,
        rev: Option<&str>,
        dest: &Utf8Path,
        sparse_paths: Option<&[String]>,
        extra_config: Option<&[String]>,
    ) -> Result<()> {
        if !dest.is_clone_target()? {
            return Err(Error::Usage(format!(
                "fatal: destination path '{dest}' already exists and is not an empty directory."
            )));
        }

        let engine = Arc::clone(self);
        let url_owned = url.to_string();
        let dest_owned = dest.to_path_buf();
        let rev_owned = rev.map(String::from);
        let sparse_owned = sparse_paths.map(<[String]>::to_vec);
        let config_owned = extra_config.map(<[String]>::to_vec);

        self.cache.with_mirror(url, local, move |mirror_dir, attempt| {
            if attempt > 0 {
                purge_dir_contents(&dest_owned)?;
            }

            if let Some(paths) = &sparse_owned {
                engine.exec(vec![
                    "git".into(),
                    "clone".into(),
                    if engine.verbose { "--verbose".into() } else { "--quiet".into() },
                    "--no-checkout".into(),
                    mirror_dir.to_string(),
                    dest_owned.to_string(),
                ])?;
                engine.exec_in(
                    &dest_owned,
                    vec![
                        "git".into(),
                        "sparse-checkout".into(),
                        "init".into(),
                        "--cone".into(),
                    ],
                )?;
                let mut argv = vec!["git".to_string(), "sparse-checkout".into(), "set".into()];
                argv.extend(paths.iter().cloned());
                engine.exec_in(&dest_owned, argv)?;
                let rev = rev_owned
                    .as_deref()
                    .expect("sparse mode requires a branch, enforced by the orchestrator");
                engine.exec_in(
                    &dest_owned,
                    vec!["git".into(), "checkout".into(), "--quiet".into(), rev.to_string()],
                )?;
            } else {
                let mut argv = vec!["git".to_string(), "clone".into()];
                argv.push(if engine.verbose { "--verbose".into() } else { "--quiet".into() });
                argv.push("--reference".into());
                argv.push(mirror_dir.to_string());
                if let Some(configs) = &config_owned {
                    for c in configs {
                        argv.push("--config".into());
                        argv.push(c.clone());
                    }
                }
                argv.push("--".into());
                argv.push(url_owned.clone());
                argv.push(dest_owned.to_string());
                engine.exec(argv)?;
            }
            Ok(())
        })?;

        if sparse_paths.is_none() {
            if let Some(rev) = rev {
                self.exec_in(
                    dest,
                    vec![
                        "git".into(),
                        "checkout".into(),
                        "--quiet".into(),
                        rev.to_string(),
                    ],
                )?;
            }
        }

        self.update_submodules(dest, url, local)?;
        Ok(())
    }

    /// Discovers direct submodules of `pwd`, dispatches one detached
    /// worker per submodule onto the rayon global pool, persists the
    /// discovered URL list for this mirror *while those workers are
    /// still in flight* (so a concurrent prefetch can see it before the
    /// whole, possibly slow, recursive fetch completes), and only then
    /// blocks until every worker has reported back.
    fn update_submodules(self: &Arc<Self>, pwd: &Utf8Path, parent_url: &str, parent_local: bool) -> Result<()> {
        if !pwd.join(".gitmodules").exists() {
            return Ok(());
        }

        let output = self.exec_in(pwd, vec!["git".into(), "submodule".into(), "init".into()])?;
        let specs: Vec<(String, String)> = output.lines().filter_map(urlkey::parse_submodule_line).collect();
        let urls: Vec<String> = specs.iter().map(|(_, url)| url.clone()).collect();

        let (tx, rx) = mpsc::channel::<Result<()>>();
        let pwd = pwd.to_path_buf();
        for (path, url) in specs {
            let engine = Arc::clone(self);
            let tx = tx.clone();
            let pwd = pwd.clone();
            rayon::spawn(move || {
                let result = (|| -> Result<()> {
                    println!("git-fastclone: fetching submodule {path} from {url}...");
                    let local = urlkey::is_local(&url);
                    engine.cache.with_mirror(&url, local, |mirror_dir, _attempt| {
                        let mut argv = vec!["git".to_string(), "submodule".into(), "update".into()];
                        if !engine.verbose {
                            argv.push("--quiet".into());
                        }
                        argv.push("--reference".into());
                        argv.push(mirror_dir.to_string());
                        argv.push("--".into());
                        argv.push(path.clone());
                        engine.exec_in(&pwd, argv).map(|_| ())
                    })?;
                    engine.update_submodules(&pwd.join(&path), &url, local)?;
                    Ok(())
                })();
                let _ = tx.send(result);
            });
        }
        drop(tx);

        self.cache.update_submodule_list(parent_url, parent_local, &urls)?;

        let mut first_err = None;
        for result in rx {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn purge_dir_contents(dir: &Utf8Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
