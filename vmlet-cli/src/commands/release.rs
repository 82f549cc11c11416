use clap::Args;
use vmlet::{FdClient, VmletError};

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Key(s) to release
    #[arg(required = true, num_args = 1..)]
    pub keys: Vec<String>,

    /// Stop at the first key that fails instead of trying the rest
    #[arg(long)]
    pub fail_fast: bool,
}

/// What happened to one key.
enum Outcome {
    Released,
    Failed(VmletError),
    Skipped,
}

async fn release_all(client: &FdClient, keys: &[String], fail_fast: bool) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(keys.len());
    let mut failed = false;
    for key in keys {
        if failed && fail_fast {
            outcomes.push(Outcome::Skipped);
            continue;
        }
        match client.release_fds(key).await {
            Ok(()) => outcomes.push(Outcome::Released),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Release failed");
                failed = true;
                outcomes.push(Outcome::Failed(e));
            }
        }
    }
    outcomes
}

pub async fn execute(args: ReleaseArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let client = global.client();
    let outcomes = release_all(&client, &args.keys, args.fail_fast).await;

    let mut failed = 0;
    let mut skipped = 0;
    for (key, outcome) in args.keys.iter().zip(&outcomes) {
        match outcome {
            Outcome::Released => println!("{}: released", key),
            Outcome::Failed(e) => {
                failed += 1;
                println!("{}: error", key);
                eprintln!("{}: {}", key, e);
            }
            Outcome::Skipped => {
                skipped += 1;
                println!("{}: skipped", key);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!(
            "Failed to release {} of {} key(s){}",
            failed,
            outcomes.len(),
            if skipped > 0 {
                format!(", {} skipped", skipped)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}
