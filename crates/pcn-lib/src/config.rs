use clap_serde_derive::{
    clap::{self, Parser},
    ClapSerde,
};
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::debug;

use crate::types::{Privkey, Pubkey};

/// One day of blocks, the default CSV delay on revokeable outputs.
pub const DEFAULT_COMMITMENT_DELAY_BLOCKS: u16 = 144;
/// Lower bound an acceptor enforces on the proposed CSV delay.
pub const MIN_COMMITMENT_DELAY_BLOCKS: u16 = 4;
/// Upper bound an acceptor enforces on the proposed CSV delay.
pub const MAX_COMMITMENT_DELAY_BLOCKS: u16 = 2016;

/// Outputs below this amount are trimmed from commitment transactions.
pub const DEFAULT_DUST_LIMIT_SATS: u64 = 546;

/// Flat fee reserved out of the funder's balance for the commitment
/// transaction itself.
pub const DEFAULT_COMMITMENT_FEE_SATS: u64 = 1500;

/// Fee of one pre-signed second stage HTLC transaction.
pub const DEFAULT_SECOND_STAGE_FEE_SATS: u64 = 300;

/// Balance each side must keep unspendable so it always has something to
/// lose by broadcasting a revoked commitment.
pub const DEFAULT_RESERVE_SATS: u64 = 10_000;

pub const DEFAULT_MAX_HTLC_VALUE_IN_FLIGHT_SATS: u64 = u64::MAX;
pub const DEFAULT_MAX_HTLC_NUMBER_IN_FLIGHT: u64 = 30;
/// Hard cap on HTLCs per commitment; beyond this the transaction risks
/// growing past standardness limits.
pub const MAX_HTLC_NUMBER_LIMIT: u64 = 253;

/// The minimal value of a forwarded HTLC. 1 satoshi means no minimum.
pub const DEFAULT_MIN_HTLC_VALUE_SATS: u64 = 1;

/// Blocks an incoming HTLC must outlive the outgoing one by when forwarding.
pub const DEFAULT_HTLC_EXPIRY_DELTA_BLOCKS: u64 = 40;
pub const MIN_HTLC_EXPIRY_DELTA_BLOCKS: u64 = 6;

/// Forwarding fee in millionths of the forwarded amount. 1000 means 0.1%.
pub const DEFAULT_HTLC_FEE_PROPORTIONAL_MILLIONTHS: u64 = 1000;

/// Whether to accept incoming channel opens without an operator command.
pub const DEFAULT_AUTO_ACCEPT_CHANNELS: bool = true;
/// Minimum funding amount for auto accepting an incoming channel open.
pub const DEFAULT_AUTO_ACCEPT_MIN_FUNDING_SATS: u64 = 100_000;

/// Confirmations before a funding output counts as irreversibly on chain.
/// Reorgs deeper than this are out of scope for close classification too.
pub const DEFAULT_FUNDING_CONFIRMATIONS: u32 = 6;

/// Confirmations before a sweep output counts as resolved.
pub const DEFAULT_RESOLUTION_CONFIRMATIONS: u32 = 6;

#[derive(ClapSerde, Debug, Clone)]
pub struct NodeConfig {
    /// Hex encoded node secret key file, relative to the base directory.
    /// Generated on first start when absent.
    #[arg(
        name = "NODE_KEY_FILE",
        long = "node-key-file",
        env,
        help = "node secret key file [default: $BASE_DIR/node_key]"
    )]
    pub key_file: Option<PathBuf>,

    #[default(DEFAULT_COMMITMENT_DELAY_BLOCKS)]
    #[arg(
        name = "NODE_COMMITMENT_DELAY_BLOCKS",
        long = "node-commitment-delay-blocks",
        env,
        help = format!("CSV delay on our revokeable outputs, in blocks [default: {}]", DEFAULT_COMMITMENT_DELAY_BLOCKS)
    )]
    pub commitment_delay_blocks: u16,

    #[default(DEFAULT_DUST_LIMIT_SATS)]
    #[arg(
        name = "NODE_DUST_LIMIT_SATS",
        long = "node-dust-limit-sats",
        env,
        help = format!("smallest commitment output we keep, in satoshis [default: {}]", DEFAULT_DUST_LIMIT_SATS)
    )]
    pub dust_limit_sats: u64,

    #[default(DEFAULT_COMMITMENT_FEE_SATS)]
    #[arg(
        name = "NODE_COMMITMENT_FEE_SATS",
        long = "node-commitment-fee-sats",
        env,
        help = format!("fee reserved for the commitment transaction [default: {}]", DEFAULT_COMMITMENT_FEE_SATS)
    )]
    pub commitment_fee_sats: u64,

    #[default(DEFAULT_SECOND_STAGE_FEE_SATS)]
    #[arg(
        name = "NODE_SECOND_STAGE_FEE_SATS",
        long = "node-second-stage-fee-sats",
        env,
        help = format!("fee of one second stage HTLC transaction [default: {}]", DEFAULT_SECOND_STAGE_FEE_SATS)
    )]
    pub second_stage_fee_sats: u64,

    #[default(DEFAULT_RESERVE_SATS)]
    #[arg(
        name = "NODE_RESERVE_SATS",
        long = "node-reserve-sats",
        env,
        help = format!("balance each side keeps unspendable [default: {}]", DEFAULT_RESERVE_SATS)
    )]
    pub reserve_sats: u64,

    #[default(DEFAULT_MAX_HTLC_VALUE_IN_FLIGHT_SATS)]
    #[arg(
        name = "NODE_MAX_HTLC_VALUE_IN_FLIGHT_SATS",
        long = "node-max-htlc-value-in-flight-sats",
        env,
        help = "maximum total value of pending HTLCs we accept [default: unlimited]"
    )]
    pub max_htlc_value_in_flight_sats: u64,

    #[default(DEFAULT_MAX_HTLC_NUMBER_IN_FLIGHT)]
    #[arg(
        name = "NODE_MAX_HTLC_NUMBER_IN_FLIGHT",
        long = "node-max-htlc-number-in-flight",
        env,
        help = format!("maximum number of pending HTLCs we accept [default: {}]", DEFAULT_MAX_HTLC_NUMBER_IN_FLIGHT)
    )]
    pub max_htlc_number_in_flight: u64,

    #[default(DEFAULT_MIN_HTLC_VALUE_SATS)]
    #[arg(
        name = "NODE_MIN_HTLC_VALUE_SATS",
        long = "node-min-htlc-value-sats",
        env,
        help = format!("minimal HTLC value we forward or accept [default: {}]", DEFAULT_MIN_HTLC_VALUE_SATS)
    )]
    pub min_htlc_value_sats: u64,

    #[default(DEFAULT_HTLC_EXPIRY_DELTA_BLOCKS)]
    #[arg(
        name = "NODE_HTLC_EXPIRY_DELTA_BLOCKS",
        long = "node-htlc-expiry-delta-blocks",
        env,
        help = format!("blocks an incoming HTLC must outlive the outgoing one [default: {}]", DEFAULT_HTLC_EXPIRY_DELTA_BLOCKS)
    )]
    pub htlc_expiry_delta_blocks: u64,

    #[default(DEFAULT_HTLC_FEE_PROPORTIONAL_MILLIONTHS)]
    #[arg(
        name = "NODE_HTLC_FEE_PROPORTIONAL_MILLIONTHS",
        long = "node-htlc-fee-proportional-millionths",
        env,
        help = format!("forwarding fee in millionths of the amount [default: {}]", DEFAULT_HTLC_FEE_PROPORTIONAL_MILLIONTHS)
    )]
    pub htlc_fee_proportional_millionths: u64,

    #[default(DEFAULT_AUTO_ACCEPT_CHANNELS)]
    #[arg(
        name = "NODE_AUTO_ACCEPT_CHANNELS",
        long = "node-auto-accept-channels",
        env,
        help = format!("accept incoming channel opens automatically [default: {}]", DEFAULT_AUTO_ACCEPT_CHANNELS)
    )]
    pub auto_accept_channels: bool,

    #[default(DEFAULT_AUTO_ACCEPT_MIN_FUNDING_SATS)]
    #[arg(
        name = "NODE_AUTO_ACCEPT_MIN_FUNDING_SATS",
        long = "node-auto-accept-min-funding-sats",
        env,
        help = format!("minimum funding amount for auto accept [default: {}]", DEFAULT_AUTO_ACCEPT_MIN_FUNDING_SATS)
    )]
    pub auto_accept_min_funding_sats: u64,

    /// Store directory, relative to the base directory.
    #[arg(
        name = "NODE_STORE_PATH",
        long = "node-store-path",
        env,
        help = "store directory [default: $BASE_DIR/store]"
    )]
    pub store_path: Option<PathBuf>,
}

#[derive(ClapSerde, Debug, Clone)]
pub struct ChainConfig {
    #[default(DEFAULT_FUNDING_CONFIRMATIONS)]
    #[arg(
        name = "CHAIN_FUNDING_CONFIRMATIONS",
        long = "chain-funding-confirmations",
        env,
        help = format!("confirmations before a funding output is final [default: {}]", DEFAULT_FUNDING_CONFIRMATIONS)
    )]
    pub funding_confirmations: u32,

    #[default(DEFAULT_RESOLUTION_CONFIRMATIONS)]
    #[arg(
        name = "CHAIN_RESOLUTION_CONFIRMATIONS",
        long = "chain-resolution-confirmations",
        env,
        help = format!("confirmations before a sweep is considered resolved [default: {}]", DEFAULT_RESOLUTION_CONFIRMATIONS)
    )]
    pub resolution_confirmations: u32,
}

#[derive(ClapSerde, Debug, Clone)]
pub struct BackupConfig {
    /// Encrypted channel backup file, relative to the base directory.
    #[arg(
        name = "BACKUP_FILE",
        long = "backup-file",
        env,
        help = "encrypted channel backup file [default: $BASE_DIR/channels.backup]"
    )]
    pub backup_file: Option<PathBuf>,

    /// Password deriving the backup encryption key. Without it the backup
    /// actor refuses to start.
    #[arg(
        name = "BACKUP_PASSWORD",
        long = "backup-password",
        env,
        help = "password for the channel backup encryption key"
    )]
    pub password: Option<String>,
}

#[derive(Parser)]
#[command(version, about = "pcnd: a payment channel network node")]
struct Args {
    /// Config file
    #[arg(
        short,
        long = "config",
        env = "PCN_CONFIG",
        help = "config file [default: $BASE_DIR/config.yml]"
    )]
    config_path: Option<PathBuf>,

    #[arg(
        short = 'd',
        long = "dir",
        env = "PCN_BASE_DIR",
        default_value = ".",
        help = "base directory for node data"
    )]
    base_dir: PathBuf,

    #[command(flatten)]
    node: <NodeConfig as ClapSerde>::Opt,

    #[command(flatten)]
    chain: <ChainConfig as ClapSerde>::Opt,

    #[command(flatten)]
    backup: <BackupConfig as ClapSerde>::Opt,
}

/// The sections as they appear in the yaml config file. CLI arguments and
/// environment variables override file values field by field.
#[derive(Deserialize, Default)]
struct SerdeConfig {
    node: Option<<NodeConfig as ClapSerde>::Opt>,
    chain: Option<<ChainConfig as ClapSerde>::Opt>,
    backup: Option<<BackupConfig as ClapSerde>::Opt>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub node: NodeConfig,
    pub chain: ChainConfig,
    pub backup: BackupConfig,
}

impl Config {
    pub fn parse() -> Self {
        let mut args = Args::parse();
        let config_path = args
            .config_path
            .clone()
            .unwrap_or_else(|| args.base_dir.join("config.yml"));
        let file_config = match fs::File::open(&config_path) {
            Ok(f) => match serde_yaml::from_reader::<_, SerdeConfig>(f) {
                Ok(config) => config,
                Err(err) => panic!("error in config file {}: {}", config_path.display(), err),
            },
            Err(_) => {
                debug!(
                    "config file {} not found, using defaults",
                    config_path.display()
                );
                SerdeConfig::default()
            }
        };
        let node = match file_config.node {
            Some(file) => NodeConfig::from(file).merge(&mut args.node),
            None => NodeConfig::from(&mut args.node),
        };
        let chain = match file_config.chain {
            Some(file) => ChainConfig::from(file).merge(&mut args.chain),
            None => ChainConfig::from(&mut args.chain),
        };
        let backup = match file_config.backup {
            Some(file) => BackupConfig::from(file).merge(&mut args.backup),
            None => BackupConfig::from(&mut args.backup),
        };
        Config {
            base_dir: args.base_dir,
            node,
            chain,
            backup,
        }
    }
}

impl Config {
    pub fn store_path(&self) -> PathBuf {
        self.resolve(self.node.store_path.as_deref(), "store")
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.resolve(self.node.key_file.as_deref(), "node_key")
    }

    pub fn backup_path(&self) -> PathBuf {
        self.resolve(self.backup.backup_file.as_deref(), "channels.backup")
    }

    fn resolve(&self, configured: Option<&std::path::Path>, default_name: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.base_dir.join(path),
            None => self.base_dir.join(default_name),
        }
    }

    /// Reads the hex encoded node key, generating and persisting a fresh one
    /// on first start.
    pub fn read_or_generate_node_key(&self) -> Result<Privkey, std::io::Error> {
        let path = self.node_key_path();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let bytes = hex::decode(content.trim()).map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
            })?;
            let key: [u8; 32] = bytes.try_into().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "expected 32 byte key")
            })?;
            Ok(Privkey::from(key))
        } else {
            let key = Privkey::from(crate::gen_rand_secret_key());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, hex::encode(key.as_ref()))?;
            Ok(key)
        }
    }

    pub fn node_pubkey(&self) -> Result<Pubkey, std::io::Error> {
        Ok(self.read_or_generate_node_key()?.pubkey())
    }
}

impl NodeConfig {
    pub fn channel_policy(&self) -> crate::types::ChannelPolicy {
        crate::types::ChannelPolicy {
            min_htlc_value: self.min_htlc_value_sats,
            expiry_delta: self.htlc_expiry_delta_blocks,
            fee_proportional_millionths: self.htlc_fee_proportional_millionths,
        }
    }
}
