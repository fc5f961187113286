use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::Result;
use crate::hash;
use crate::ring::Ring;
use crate::RingMember;

/// Tuning knobs of a single ring node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub ring: Ring,
    pub check_successor_interval: Duration,
    pub stabilize_interval: Duration,
    pub report_interval: Duration,
    /// Forwarding hops after which `Owner`/`Query` give up.
    pub max_hops: u32,
    pub replication_capacity: usize,
    pub sync_capacity: usize,
}

impl NodeConfig {
    pub fn new(bits: u32) -> Result<Self> {
        let ring = Ring::new(bits)?;
        Ok(NodeConfig {
            ring,
            check_successor_interval: Duration::from_secs(60),
            stabilize_interval: Duration::from_secs(120),
            report_interval: Duration::from_secs(600),
            max_hops: 2 * bits,
            replication_capacity: 50,
            sync_capacity: 16,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    Mem,
    Disk,
}

#[derive(Debug, Parser)]
#[command(name = "dht", about = "Runs one node of the ring DHT")]
pub struct NodeArgs {
    #[arg(long, env = "NODE_PORT")]
    pub port: u16,

    /// Host other nodes use to reach this one.
    #[arg(long, env = "NODE_HOSTNAME", default_value = "127.0.0.1")]
    pub hostname: String,

    /// Ring width: identifiers live in [0, 2^M).
    #[arg(short = 'm', long = "bits", env = "M")]
    pub bits: u32,

    /// Address of a node already in the ring; our own address to bootstrap a new ring.
    #[arg(long, env = "PARTNER_FULL_ADDR")]
    pub partner_addr: String,

    #[arg(long, env = "PARTNER_ID")]
    pub partner_id: u64,

    #[arg(long, env = "STORAGE_TYPE", value_enum, default_value = "mem")]
    pub storage: StorageKind,

    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "CHECK_SUCC_SECS", default_value_t = 60)]
    pub check_succ_secs: u64,

    #[arg(long, env = "STABILIZE_SECS", default_value_t = 120)]
    pub stabilize_secs: u64,

    #[arg(long, env = "REPORT_SECS", default_value_t = 600)]
    pub report_secs: u64,

    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl NodeArgs {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// The ring bootstrap keeps the id it was announced with; everyone else hashes its address.
    pub fn member(&self) -> Result<RingMember> {
        let address = self.address();
        let id = if address == self.partner_addr {
            Ring::new(self.bits)?.wrap(self.partner_id)
        } else {
            hash::ring_id(&address, self.bits)?
        };
        Ok(RingMember::new(id, address))
    }

    pub fn partner(&self) -> Result<RingMember> {
        let id = Ring::new(self.bits)?.wrap(self.partner_id);
        Ok(RingMember::new(id, self.partner_addr.clone()))
    }

    pub fn node_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::new(self.bits)?;
        config.check_successor_interval = Duration::from_secs(self.check_succ_secs);
        config.stabilize_interval = Duration::from_secs(self.stabilize_secs);
        config.report_interval = Duration::from_secs(self.report_secs);
        Ok(config)
    }
}

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "HTTP front door to the ring DHT")]
pub struct GatewayArgs {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "ROOT_NODE_ADDR")]
    pub root_node_addr: String,

    #[arg(short = 'm', long = "bits", env = "M")]
    pub bits: u32,

    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[command(name = "client", about = "Interactive shell against a ring DHT node")]
pub struct ClientArgs {
    #[arg(long, env = "NODE_ADDR", default_value = "127.0.0.1:50051")]
    pub node: String,

    #[arg(short = 'm', long = "bits", env = "M")]
    pub bits: u32,
}
