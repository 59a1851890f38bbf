//! Backfills `ownerName` / `ownerLocation` on every product from its owner's
//! user document. Requires `GOOGLE_APPLICATION_CREDENTIALS`.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    backfill_cli::run_standalone("products").await
}
