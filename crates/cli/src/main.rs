use clap::Parser;
use relay::{Server, ServerConfig};
use std::io;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay: one recorder per channel, many viewers"
)]
struct Args {
    /// RTSP bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Shared RTP socket address
    #[arg(long, default_value = "0.0.0.0:8000")]
    rtp: String,

    /// Shared RTCP socket address
    #[arg(long, default_value = "0.0.0.0:8001")]
    rtcp: String,

    /// Serve interleaved TCP only
    #[arg(long)]
    no_udp: bool,

    /// Channel created at startup
    #[arg(long, short, default_value = "live")]
    channel: String,

    /// Control connection idle timeout, in seconds
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let (rtp_addr, rtcp_addr) = if args.no_udp {
        (None, None)
    } else {
        (Some(args.rtp), Some(args.rtcp))
    };
    let config = ServerConfig {
        bind_addr: args.bind.clone(),
        rtp_addr,
        rtcp_addr,
        default_channel: Some(args.channel).filter(|c| !c.is_empty()),
        session_timeout: Duration::from_secs(args.session_timeout),
        ..ServerConfig::default()
    };

    let mut server = Server::new(config);

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("RTSP relay on {}, press Enter to stop", args.bind);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        eprintln!("Failed to read stdin: {}", e);
    }

    for channel in server.channels() {
        println!(
            "{}: producer={} subscribers={}",
            channel.name,
            channel.producer.map(|p| p.id).unwrap_or_else(|| "-".to_string()),
            channel.subscribers.len()
        );
    }
    server.stop();
}
