use std::collections::BTreeSet;
use std::path::Path;

use opsbook_exec::{LoadOptions, Operators};

fn write_books(dir: &Path, n: usize) {
    for i in 0..n {
        std::fs::write(
            dir.join(format!("book{i:02}.yml")),
            format!("desc: book {i}\nsteps:\n  - exec:\n      command: printf {i}\n"),
        )
        .unwrap();
    }
}

fn pattern(dir: &Path) -> String {
    dir.join("*.yml").display().to_string()
}

fn selected_paths(dir: &Path, opts: LoadOptions) -> Vec<String> {
    let mut ops = Operators::load(&pattern(dir), opts).unwrap();
    ops.selected_operators()
        .unwrap()
        .iter()
        .map(|o| o.book_path_or_id())
        .collect()
}

#[test]
fn load_orders_books_by_path() {
    let dir = tempfile::tempdir().unwrap();
    write_books(dir.path(), 5);
    let paths = selected_paths(dir.path(), LoadOptions::default());
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
    assert_eq!(paths.len(), 5);
}

#[test]
fn shards_partition_the_sorted_input() {
    let dir = tempfile::tempdir().unwrap();
    write_books(dir.path(), 10);
    let all: BTreeSet<String> = selected_paths(dir.path(), LoadOptions::default())
        .into_iter()
        .collect();

    let mut union = Vec::new();
    let mut sizes = Vec::new();
    for index in 0..3 {
        let part = selected_paths(
            dir.path(),
            LoadOptions {
                shard: Some((3, index)),
                ..LoadOptions::default()
            },
        );
        sizes.push(part.len());
        union.extend(part);
    }
    assert_eq!(union.len(), all.len(), "shards must not overlap");
    let union: BTreeSet<String> = union.into_iter().collect();
    assert_eq!(union, all);
    let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
    assert!(max - min <= 1, "shard sizes differ by more than one: {sizes:?}");
}

#[test]
fn shuffle_is_deterministic_for_a_seed() {
    let dir = tempfile::tempdir().unwrap();
    write_books(dir.path(), 8);
    let opts = |seed| LoadOptions {
        shuffle_seed: Some(seed),
        ..LoadOptions::default()
    };
    let a = selected_paths(dir.path(), opts(1));
    let b = selected_paths(dir.path(), opts(1));
    assert_eq!(a, b);
    let c = selected_paths(dir.path(), opts(2));
    assert_ne!(a, c);
}

#[test]
fn sample_picks_existing_operators_without_replacement() {
    let dir = tempfile::tempdir().unwrap();
    write_books(dir.path(), 6);
    let picked = selected_paths(
        dir.path(),
        LoadOptions {
            sample: Some(3),
            ..LoadOptions::default()
        },
    );
    assert_eq!(picked.len(), 3);
    let unique: BTreeSet<String> = picked.iter().cloned().collect();
    assert_eq!(unique.len(), 3);
}

#[test]
fn random_rebuilds_fresh_operators_with_replacement() {
    let dir = tempfile::tempdir().unwrap();
    write_books(dir.path(), 2);
    let picked = selected_paths(
        dir.path(),
        LoadOptions {
            random: Some(5),
            ..LoadOptions::default()
        },
    );
    // Five operators out of two books: some book is repeated.
    assert_eq!(picked.len(), 5);
}

#[test]
fn run_match_filters_book_paths() {
    let dir = tempfile::tempdir().unwrap();
    write_books(dir.path(), 4);
    let picked = selected_paths(
        dir.path(),
        LoadOptions {
            run_match: Some("book0[01]".to_string()),
            ..LoadOptions::default()
        },
    );
    assert_eq!(picked.len(), 2);
}

#[test]
fn skip_included_drops_books_other_books_include() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("child.yml"),
        "desc: child\nsteps:\n  - exec:\n      command: 'true'\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("parent.yml"),
        "desc: parent\nsteps:\n  - include: child.yml\n",
    )
    .unwrap();
    let picked = selected_paths(
        dir.path(),
        LoadOptions {
            skip_included: true,
            ..LoadOptions::default()
        },
    );
    assert_eq!(picked.len(), 1);
    assert!(picked[0].ends_with("parent.yml"));
}

#[tokio::test]
async fn run_n_counts_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("ok.yml"),
        "desc: ok\nsteps:\n  - exec:\n      command: 'true'\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("bad.yml"),
        "desc: bad\nsteps:\n  - test: 'false'\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("skipped.yml"),
        "desc: skipped\nif: 'false'\nsteps:\n  - exec:\n      command: 'true'\n",
    )
    .unwrap();

    let mut ops = Operators::load(
        &pattern(dir.path()),
        LoadOptions {
            parallel: Some(3),
            ..LoadOptions::default()
        },
    )
    .unwrap();
    // Failures without fail-fast never abort peers.
    ops.run_n().await.unwrap();
    let (total, success, failure, skipped) = ops.result().counts();
    assert_eq!((total, success, failure, skipped), (3, 1, 1, 1));
}

#[tokio::test]
async fn fail_fast_aborts_the_group() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("bad.yml"),
        "desc: bad\nfailFast: true\nsteps:\n  - test: 'false'\n",
    )
    .unwrap();
    let mut ops = Operators::load(&pattern(dir.path()), LoadOptions::default()).unwrap();
    let err = ops.run_n().await.unwrap_err().to_string();
    assert!(err.contains("test failed on"), "{err}");
}
