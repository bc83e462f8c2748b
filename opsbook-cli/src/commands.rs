use opsbook_exec::{LoadOptions, Operators, Options};

use crate::exit_codes;
use crate::Command;

pub async fn dispatch(command: Command) -> i32 {
    match command {
        Command::Run {
            pattern,
            parallel,
            fail_fast,
            shuffle,
            shard_n,
            shard_index,
            sample,
            random,
            skip_included,
            run_match,
            skip_test,
            debug,
            profile_out,
        } => {
            let opts = LoadOptions {
                run_match,
                skip_included,
                shuffle_seed: shuffle,
                shard: shard_n.zip(shard_index),
                sample,
                random,
                parallel,
                profile: profile_out.is_some(),
                op: Options {
                    debug: if debug { Some(true) } else { None },
                    fail_fast: if fail_fast { Some(true) } else { None },
                    skip_test: if skip_test { Some(true) } else { None },
                    ..Options::default()
                },
            };
            let mut ops = match Operators::load(&pattern, opts) {
                Ok(ops) => ops,
                Err(e) => {
                    eprintln!("error: {e}");
                    return exit_codes::USAGE_ERROR;
                }
            };
            let run_out = ops.run_n().await;

            let (total, success, failure, skipped) = ops.result().counts();
            eprintln!("{total} runbooks: {success} ok, {failure} failed, {skipped} skipped");
            for (path, result) in ops.result().results() {
                if let Some(err) = &result.error {
                    eprintln!("--- {path}\n{err}");
                }
            }

            if let Some(path) = profile_out {
                if let Err(e) = write_profile(&ops, &path) {
                    eprintln!("error: failed to write profile: {e}");
                    return exit_codes::RUNTIME_ERROR;
                }
            }

            match run_out {
                Ok(()) if failure == 0 => exit_codes::OK,
                Ok(()) => exit_codes::RUN_FAILURE,
                Err(e) => {
                    eprintln!("error: {e}");
                    exit_codes::RUN_FAILURE
                }
            }
        }
        Command::List {
            pattern,
            run_match,
            skip_included,
        } => {
            let opts = LoadOptions {
                run_match,
                skip_included,
                ..LoadOptions::default()
            };
            match Operators::load(&pattern, opts) {
                Ok(ops) => {
                    for o in ops.operators() {
                        match o.desc() {
                            "" => println!("{}", o.book_path_or_id()),
                            desc => println!("{}\t{desc}", o.book_path_or_id()),
                        }
                    }
                    exit_codes::OK
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    exit_codes::USAGE_ERROR
                }
            }
        }
    }
}

fn write_profile(ops: &Operators, path: &std::path::Path) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    ops.dump_profile(&mut file)
}
