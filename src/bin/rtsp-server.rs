use clap::{Parser, ValueEnum};
use rtsp::auth::AuthDb;
use rtsp::media::h264::H264FileSubsession;
use rtsp::media::h265::H265FileSubsession;
use rtsp::session_media::ServerMediaSubsession;
use rtsp::{Server, ServerConfig};
use std::io;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Codec {
    H264,
    H265,
}

#[derive(Parser)]
#[command(
    name = "rtsp-server",
    about = "Standalone RTSP server for H.264/H.265 streams"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Annex B elementary stream file to serve as the default mount. When
    /// omitted, a minimal embedded sample is served instead.
    #[arg(long)]
    file: Option<String>,

    /// Codec of the default mount's stream, when --file is given.
    #[arg(long, value_enum, default_value_t = Codec::H264)]
    codec: Codec,

    /// Digest authentication realm. Only takes effect when --auth-user is
    /// also given.
    #[arg(long, default_value = "rtsp-rs")]
    auth_realm: String,

    /// Require Digest authentication with this username (see --auth-pass).
    #[arg(long, requires = "auth_pass")]
    auth_user: Option<String>,

    /// Password for --auth-user.
    #[arg(long, requires = "auth_user")]
    auth_pass: Option<String>,

    /// Allow RTP/AVP/TCP (interleaved) delivery for clients behind restrictive firewalls.
    #[arg(long, default_value_t = true)]
    allow_rtp_over_tcp: bool,

    /// Attach every client SETUP after the first to the already-running pipeline.
    #[arg(long, default_value_t = false)]
    reuse_first_source: bool,

    /// Also listen for RTSP-over-HTTP tunneled connections on this port.
    #[arg(long)]
    http_tunnel_port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = ServerConfig::default();
    if let (Some(user), Some(pass)) = (&args.auth_user, &args.auth_pass) {
        let mut db = AuthDb::new(args.auth_realm.clone());
        db.add_user(user, pass);
        config.auth_db = Some(db);
    }
    config.allow_rtp_over_tcp = args.allow_rtp_over_tcp;
    config.reuse_first_source = args.reuse_first_source;
    config.http_tunnel_port = args.http_tunnel_port;

    let mut server = match &args.file {
        Some(path) => {
            let subsession: Box<dyn ServerMediaSubsession> = match args.codec {
                Codec::H264 => Box::new(
                    H264FileSubsession::new(path.clone())
                        .unwrap_or_else(|e| panic!("failed to open {path}: {e}")),
                ),
                Codec::H265 => Box::new(
                    H265FileSubsession::new(path.clone())
                        .unwrap_or_else(|e| panic!("failed to open {path}: {e}")),
                ),
            };
            Server::with_subsession(&args.bind, subsession, config)
        }
        None => Server::with_config(&args.bind, config),
    };

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("RTSP server on {} — press Enter to stop", args.bind);
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    server.stop();
}
