//! Fills `participants` on chats that lack it, from `buyerId` and `farmerId`.
//! Requires `GOOGLE_APPLICATION_CREDENTIALS`.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    backfill_cli::run_standalone("chats").await
}
