// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::process::ExitCode;

use clap::Parser;

use wirehub::config::HubConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let config = HubConfig::parse();
    wirehub::init_tracing();

    match wirehub::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("wirehub exited: {err:#}");
            ExitCode::FAILURE
        }
    }
}
