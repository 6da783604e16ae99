// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Monitor Service node binary.

use mon_node::{config, log, runner::Runner};

use clap::Parser;
use color_eyre::eyre::Result;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "monitord", version)]
/// Monitor Service node
struct Args {
    /// Configuration file path; `-` reads from stdin. Defaults to
    /// monitord.{yaml|yml|toml|json} under the user config directory.
    #[clap(long = "conf", value_name = "PATH")]
    conf: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let conf = config::load(args.conf)?;
    log::init_node_logging(conf.log.as_deref())?;

    let runner = Runner::create(conf).await?;
    info!("monitor node running");

    tokio::select! {
        _ = runner.closed() => debug!("runner closed"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
        }
    }

    runner.close().await;
    Ok(())
}
