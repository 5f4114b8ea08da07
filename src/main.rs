mod command;
mod connection;
mod listener;
mod logger;
mod mail;
mod session;
mod shutdown;
mod sink;
mod storage;
mod tls;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-sink",
    about = "A capture-only SMTP server that swallows inbound mail into flat .eml files"
)]
pub struct Opt {
    /// Bind address
    #[structopt(short = "b", long = "bind", default_value = "0.0.0.0")]
    pub bind: String,

    /// Plain SMTP port (-1 disables the plain listener)
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: i32,

    /// TLS SMTP port (-1 disables the secure listener)
    #[structopt(long = "secure-port", default_value = "465")]
    pub secure_port: i32,

    /// Directory to save accepted messages to
    #[structopt(long = "save-to", default_value = "mails", parse(from_os_str))]
    pub save_dir: PathBuf,

    /// TLS certificate file (PEM)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PKCS#8 PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Max body size in bytes (default 50 MiB)
    #[structopt(long = "max-body-size", default_value = "52428800")]
    pub max_body_size: u64,

    /// Max header size in bytes (default 1 MiB)
    #[structopt(long = "max-header-size", default_value = "1048576")]
    pub max_header_size: u64,

    /// Max cumulative recipient size in bytes (default 1 MiB)
    #[structopt(long = "max-recipient-size", default_value = "1048576")]
    pub max_recipient_size: u64,

    /// Mirror log output to this file
    #[structopt(long = "log-file", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Show protocol-level detail
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

fn print_config(opt: &Opt) {
    println!("Config: bind               => {}", opt.bind);
    println!("Config: port               => {}", opt.port);
    println!("Config: secure-port        => {}", opt.secure_port);
    println!("Config: save-to            => {:?}", opt.save_dir);
    println!("Config: tls-cert           => {:?}", opt.tls_cert);
    println!("Config: tls-key            => {:?}", opt.tls_key);
    println!("Config: max-body-size      => {}", opt.max_body_size);
    println!("Config: max-header-size    => {}", opt.max_header_size);
    println!("Config: max-recipient-size => {}", opt.max_recipient_size);
    println!("Config: log-file           => {:?}", opt.log_file);
    println!("Config: verbose            => {}", opt.verbose);
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();
    print_config(&opt);

    let sink = Arc::new(sink::MailSink::new(opt)?);
    sink.logger
        .log(&format!("Saving mails to {:?}", sink.opt.save_dir));

    shutdown::install_signal_handler(Arc::clone(&sink.shutdown), sink.logger.clone());

    let logger = sink.logger.clone();
    Arc::clone(&sink).run().await?;
    logger.log("Bye.");
    Ok(())
}
