use clap::Parser;
use guildnet_common::args::PostgresArgs;

#[derive(Parser, Debug, Clone)]
pub struct MeshArgs {
    #[arg(long, env = "MESH_LOGIN_SERVER")]
    pub login_server: String,

    #[arg(long, env = "MESH_PREAUTH_KEY")]
    pub preauth_key: String,

    #[arg(long, env = "MESH_HOSTNAME")]
    pub hostname: String,

    #[arg(long, env = "MESH_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct ListenArgs {
    /// Port the mesh-reachable (peer-facing) HTTP Surface listener binds to.
    #[arg(long, env = "MESH_LISTEN_PORT", default_value_t = 8443)]
    pub mesh_port: u16,

    /// Loopback-only admin/shutdown socket.
    #[arg(long, env = "ADMIN_LISTEN_PORT", default_value_t = 7443)]
    pub admin_port: u16,
}

#[derive(Parser, Debug, Clone)]
pub struct TlsArgs {
    #[arg(long, env = "TLS_CERT_PATH")]
    pub cert_path: Option<String>,

    #[arg(long, env = "TLS_KEY_PATH")]
    pub key_path: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct StateArgs {
    #[arg(long, env = "STATE_DIR", default_value = "state")]
    pub state_dir: String,
}

#[derive(Parser, Debug, Clone)]
pub struct OperatorAuthArgs {
    /// Single operator bearer token; there is no per-user auth.
    #[arg(long, env = "OPERATOR_TOKEN")]
    pub operator_token: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct Args {
    #[clap(flatten)]
    pub mesh: MeshArgs,

    #[clap(flatten)]
    pub listen: ListenArgs,

    #[clap(flatten)]
    pub tls: TlsArgs,

    #[clap(flatten)]
    pub state: StateArgs,

    #[clap(flatten)]
    pub auth: OperatorAuthArgs,

    /// Postgres connection the Database Gateway uses to reach the in-cluster
    /// database endpoint it is fronting.
    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long, env = "IMAGE_PULL_SECRET")]
    pub image_pull_secret: Option<String>,

    #[arg(long, env = "INGRESS_CLASS_NAME")]
    pub ingress_class_name: Option<String>,

    #[arg(long, env = "INGRESS_TLS_SECRET")]
    pub ingress_tls_secret: Option<String>,
}

impl Args {
    pub fn state_path(&self, sub: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.state.state_dir).join(sub)
    }
}
