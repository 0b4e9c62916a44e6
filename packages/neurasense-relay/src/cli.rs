use crate::config::RelayConfig;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// NeuraSense Relay - biosignal ingest and processing-backend relay
#[derive(Parser)]
#[command(name = "neurasense-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// SQLite database file (overrides NEURASENSE_DATABASE_PATH)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one monitoring session until Ctrl-C
    Run(RunArgs),

    /// Register or update a patient
    AddPatient {
        /// Health number
        health_number: String,

        /// Full name
        #[arg(long)]
        name: String,

        /// Birthdate (YYYY-MM-DD)
        #[arg(long)]
        birthdate: NaiveDate,

        /// Reason for ECMO
        #[arg(long)]
        reason: Option<String>,
    },

    /// List recorded sessions for a patient
    Sessions {
        /// Health number
        health_number: String,
    },

    /// Delete one recorded session
    DeleteSession {
        /// Session record id
        id: i64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Health number of the monitored patient
    #[arg(short, long)]
    pub patient: String,

    /// UDP listen address
    #[arg(long)]
    pub udp_host: Option<String>,

    /// UDP listen port
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Processing backend WebSocket URL
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Expected channel count per datagram
    #[arg(long)]
    pub channels: Option<usize>,

    /// Keep running when the backend is unreachable
    #[arg(long)]
    pub allow_offline: bool,

    /// Mark relayed frames as simulated data
    #[arg(long)]
    pub simulate: bool,

    /// Seconds between status lines
    #[arg(long, default_value = "10")]
    pub status_interval: u64,

    /// Use a throwaway in-memory database
    #[arg(long)]
    pub in_memory: bool,
}

impl RunArgs {
    /// Command-line values win over the environment
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.udp_host {
            config.udp_host = host.clone();
        }
        if let Some(port) = self.udp_port {
            config.udp_port = port;
        }
        if let Some(url) = &self.backend_url {
            config.backend_url = url.clone();
        }
        if let Some(channels) = self.channels {
            config.channel_count = Some(channels);
        }
        if self.allow_offline {
            config.allow_offline = true;
        }
    }
}
