//! Runs many operators: path-pattern loading, regex filtering,
//! shuffle/shard/sample/random selection, and semaphore-bounded execution.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use opsbook_core::load_book;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::ExecError;
use crate::operator::{Operator, Options};
use crate::profile::Stopwatch;
use crate::result::RunNResult;
use crate::RUN_MATCH_ENV;

#[derive(Clone, Default)]
pub struct LoadOptions {
    /// Regex over book paths; falls back to `OPSBOOK_RUN`, then to
    /// everything.
    pub run_match: Option<String>,
    /// Drop books that another selected book includes.
    pub skip_included: bool,
    pub shuffle_seed: Option<u64>,
    /// `(shard count, this shard's index)`.
    pub shard: Option<(usize, usize)>,
    /// Uniform pick of N operators, without replacement.
    pub sample: Option<usize>,
    /// N operators drawn with replacement, rebuilt fresh from the chosen
    /// books.
    pub random: Option<usize>,
    /// Operator parallelism cap; 1 when absent.
    pub parallel: Option<usize>,
    pub profile: bool,
    pub op: Options,
}

pub struct Operators {
    ops: Vec<Operator>,
    opts: LoadOptions,
    pmax: usize,
    sw: Arc<Stopwatch>,
    result: Arc<RunNResult>,
}

impl Operators {
    /// Expand the path pattern into books, build one operator per book,
    /// filter, and fix the running order (book path, then description).
    pub fn load(pattern: &str, opts: LoadOptions) -> Result<Self, ExecError> {
        let sw = Arc::new(Stopwatch::new(opts.profile));
        let mut op_opts = opts.op.clone();
        op_opts.profile = opts.profile;
        op_opts.stopwatch = Some(sw.clone());

        let paths = expand_path_pattern(pattern)?;
        if paths.is_empty() {
            return Err(ExecError::NoBooks(pattern.to_string()));
        }

        let run_match = match opts
            .run_match
            .clone()
            .or_else(|| std::env::var(RUN_MATCH_ENV).ok().filter(|s| !s.is_empty()))
        {
            Some(pattern) => Some(Regex::new(&pattern)?),
            None => None,
        };

        let mut ops = Vec::new();
        for path in &paths {
            let book = load_book(path)?;
            ops.push(Operator::new(book, &op_opts)?);
        }

        let mut skip_paths: Vec<PathBuf> = Vec::new();
        if opts.skip_included {
            for o in &ops {
                skip_paths.extend(o.included_paths());
            }
        }

        ops.retain(|o| {
            let path = o.book_path_or_id();
            if let Some(re) = &run_match {
                if !re.is_match(&path) {
                    debug!(book = %path, "skipping book (does not match run filter)");
                    return false;
                }
            }
            if let Some(p) = o.book_path() {
                if skip_paths.contains(p) {
                    debug!(book = %path, "skipping book (already included from another book)");
                    return false;
                }
            }
            true
        });

        ops.sort_by(|a, b| {
            (a.book_path_or_id(), a.desc().to_string())
                .cmp(&(b.book_path_or_id(), b.desc().to_string()))
        });

        let pmax = opts.parallel.unwrap_or(1).max(1);
        Ok(Self {
            ops,
            opts,
            pmax,
            sw,
            result: Arc::new(RunNResult::default()),
        })
    }

    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    pub fn result(&self) -> &RunNResult {
        &self.result
    }

    pub fn dump_profile<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.sw.dump_profile(w)
    }

    /// Apply shuffle, shard, sample and random in that order. Shuffle,
    /// shard and sample keep operator identity; random rebuilds fresh
    /// operators from the chosen books.
    pub fn selected_operators(&mut self) -> Result<Vec<Operator>, ExecError> {
        let mut ops = std::mem::take(&mut self.ops);
        if let Some(seed) = self.opts.shuffle_seed {
            shuffle(&mut ops, seed);
        }
        if let Some((n, index)) = self.opts.shard {
            ops = shard(ops, n, index);
        }
        if let Some(n) = self.opts.sample {
            ops = sample(ops, n, &mut rand::thread_rng());
        }
        if let Some(n) = self.opts.random {
            let mut rng = rand::thread_rng();
            let mut op_opts = self.opts.op.clone();
            op_opts.profile = self.opts.profile;
            op_opts.stopwatch = Some(self.sw.clone());
            let mut fresh = Vec::with_capacity(n);
            for _ in 0..n {
                if ops.is_empty() {
                    break;
                }
                let pick = &ops[rng.gen_range(0..ops.len())];
                let Some(path) = pick.book_path().cloned() else {
                    continue;
                };
                let book = load_book(&path)?;
                fresh.push(Operator::new(book, &op_opts)?);
            }
            return Ok(fresh);
        }
        Ok(ops)
    }

    /// Run the selected operators under a semaphore of `pmax` permits.
    /// A failing fail-fast operator aborts the whole group; other failures
    /// are recorded and never touch their peers.
    pub async fn run_n(&mut self) -> Result<(), ExecError> {
        let selected = self.selected_operators()?;
        self.result
            .total
            .fetch_add(selected.len() as u64, Ordering::Relaxed);

        let sem = Arc::new(Semaphore::new(self.pmax));
        let mut set: JoinSet<(bool, Result<(), ExecError>)> = JoinSet::new();
        for mut o in selected {
            // Closed only if the semaphore is dropped, which cannot happen
            // while this loop holds it. If it does, it's a bug.
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .unwrap_or_else(|_| panic!("operator semaphore closed unexpectedly"));
            let result = self.result.clone();
            set.spawn(async move {
                let _permit = permit;
                let key = o.book_path_or_id();
                let run_out = o.run().await;
                result.store(key, o.result().clone());
                (o.fail_fast(), run_out)
            });
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((fail_fast, Err(e))) => {
                    if fail_fast && first_err.is_none() {
                        first_err = Some(e);
                        set.abort_all();
                    }
                }
                Ok((_, Ok(()))) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(ExecError::TaskJoin(e.to_string())),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
}

/// Keep the items whose index is congruent to `index` modulo `n`.
fn shard<T>(items: Vec<T>, n: usize, index: usize) -> Vec<T> {
    if n == 0 {
        return items;
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % n == index)
        .map(|(_, item)| item)
        .collect()
}

fn sample<T, R: Rng>(mut items: Vec<T>, n: usize, rng: &mut R) -> Vec<T> {
    if items.len() <= n {
        return items;
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let idx = rng.gen_range(0..items.len());
        out.push(items.swap_remove(idx));
    }
    out
}

/// A literal file, a directory (every `.yml`/`.yaml`/`.json` under it), or
/// a `*`/`**` glob.
pub(crate) fn expand_path_pattern(pattern: &str) -> Result<Vec<PathBuf>, ExecError> {
    let mut out = Vec::new();
    if !pattern.contains('*') {
        let path = Path::new(pattern);
        if path.is_dir() {
            collect_books(path, &mut out);
        } else {
            out.push(path.to_path_buf());
        }
    } else {
        // Walk from the longest literal prefix and match relative paths.
        let (base, rel_pattern) = split_glob_base(pattern);
        let mut files = Vec::new();
        collect_files(&base, &mut files);
        for f in files {
            let rel = f
                .strip_prefix(&base)
                .unwrap_or(&f)
                .to_string_lossy()
                .replace('\\', "/");
            if glob_match(&rel_pattern, &rel) {
                out.push(f);
            }
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn split_glob_base(pattern: &str) -> (PathBuf, String) {
    let mut base = PathBuf::new();
    let mut rest = Vec::new();
    let mut in_glob = false;
    for part in Path::new(pattern).components() {
        let s = part.as_os_str().to_string_lossy();
        if in_glob || s.contains('*') || s.contains('?') {
            in_glob = true;
            rest.push(s.into_owned());
        } else {
            base.push(part);
        }
    }
    if base.as_os_str().is_empty() {
        base.push(".");
    }
    (base, rest.join("/"))
}

fn collect_books(dir: &Path, out: &mut Vec<PathBuf>) {
    let mut files = Vec::new();
    collect_files(dir, &mut files);
    out.extend(files.into_iter().filter(|f| {
        matches!(
            f.extension().and_then(|e| e.to_str()),
            Some("yml" | "yaml" | "json")
        )
    }));
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// `*` matches within a path segment, `**` across segments, `?` one
/// non-separator character.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn match_bytes(p: &[u8], t: &[u8]) -> bool {
    if p.is_empty() {
        return t.is_empty();
    }
    match p[0] {
        b'*' => {
            if p.len() >= 2 && p[1] == b'*' {
                let rest = if p.len() >= 3 && p[2] == b'/' {
                    &p[3..]
                } else {
                    &p[2..]
                };
                (0..=t.len()).any(|i| match_bytes(rest, &t[i..]))
            } else {
                let rest = &p[1..];
                for i in 0..=t.len() {
                    if match_bytes(rest, &t[i..]) {
                        return true;
                    }
                    if i < t.len() && t[i] == b'/' {
                        break;
                    }
                }
                false
            }
        }
        b'?' => !t.is_empty() && t[0] != b'/' && match_bytes(&p[1..], &t[1..]),
        c => !t.is_empty() && t[0] == c && match_bytes(&p[1..], &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let mut a: Vec<u32> = (0..20).collect();
        let mut b: Vec<u32> = (0..20).collect();
        shuffle(&mut a, 42);
        shuffle(&mut b, 42);
        assert_eq!(a, b);
        let mut c: Vec<u32> = (0..20).collect();
        shuffle(&mut c, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn shards_partition_without_duplicates() {
        let input: Vec<u32> = (0..10).collect();
        let mut union = Vec::new();
        let mut sizes = Vec::new();
        for index in 0..3 {
            let part = shard(input.clone(), 3, index);
            sizes.push(part.len());
            union.extend(part);
        }
        union.sort_unstable();
        assert_eq!(union, input);
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        assert!(max - min <= 1);
    }

    #[test]
    fn sample_is_without_replacement() {
        let input: Vec<u32> = (0..10).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let mut picked = sample(input.clone(), 4, &mut rng);
        picked.sort_unstable();
        picked.dedup();
        assert_eq!(picked.len(), 4);
        assert_eq!(sample(input.clone(), 100, &mut rng), input);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.yml", "book.yml"));
        assert!(!glob_match("*.yml", "dir/book.yml"));
        assert!(glob_match("**/*.yml", "a/b/book.yml"));
        assert!(glob_match("books/*.y?ml", "books/book.yaml"));
        assert!(!glob_match("books/*.yml", "books/sub/book.yml"));
    }
}
