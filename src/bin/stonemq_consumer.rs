// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use stonemq_consumer::{
    setup_tracing, AppResult, ConsumerConfig, ConsumerRecord, Consumer, FileOffsetStore,
    FnHandler, HandlerRegistry, MemoryBroker, MemoryOffsetStore, OffsetStore,
};
use tokio::runtime;
use tracing::{error, info};

const DEMO_PARTITIONS: i32 = 4;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    /// records produced to every demo partition
    #[arg(long, default_value_t = 1000)]
    pub records: usize,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let consumer_config = ConsumerConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{}", serde_json::to_string_pretty(&consumer_config)?);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _tracing_guard = setup_tracing(&commandline.log_dir, commandline.verbose);

    rt.block_on(run(consumer_config, commandline.records))
}

async fn run(consumer_config: ConsumerConfig, records: usize) -> AppResult<()> {
    let groups = consumer_config.properties()?;

    let store: Arc<dyn OffsetStore> = if consumer_config.general.offset_store_path.is_empty() {
        Arc::new(MemoryOffsetStore::new())
    } else {
        Arc::new(FileOffsetStore::open(&consumer_config.general.offset_store_path)?)
    };

    // the in-process broker answers on the first configured address
    let address = groups
        .first()
        .and_then(|props| props.brokers.first())
        .cloned()
        .unwrap_or_default();
    let broker = MemoryBroker::new(address);

    let mut handlers = HandlerRegistry::new();
    for props in &groups {
        for topic in &props.topics {
            if handlers.contains_key(topic) {
                continue;
            }
            broker.create_topic(topic.clone(), DEMO_PARTITIONS);
            for partition in 0..DEMO_PARTITIONS {
                for seq in 0..records {
                    broker.produce(
                        topic,
                        partition,
                        Vec::new(),
                        Bytes::from(format!("{}-{}-{}", topic, partition, seq)),
                    )?;
                }
            }
            handlers.insert(
                topic.clone(),
                Arc::new(FnHandler::new(|record: ConsumerRecord| async move {
                    info!(
                        "consumed {}-{}@{}: {} bytes",
                        record.topic,
                        record.partition,
                        record.offset,
                        record.payload.len()
                    );
                    Ok(())
                })),
            );
        }
    }

    let mut consumer = Consumer::new(groups, &handlers, store, &broker).await?;
    consumer.consume()?;
    info!("consumer running, press ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("listen for ctrl-c failed: {}", err);
    }
    info!("shutting down");
    consumer.close().await
}
