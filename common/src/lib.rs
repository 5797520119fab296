use std::net::IpAddr;

use anyhow::Result;
use axum::{Json, http::HeaderMap, response::IntoResponse};
use owo_colors::OwoColorize;
use reqwest::StatusCode;
use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};
use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};
use tokio_postgres_rustls::MakeRustlsConnect;

pub mod args;
pub mod cors;
pub mod metrics;
pub mod postgres;
mod request_context;
pub mod shutdown;
pub mod wait;

pub use request_context::*;

/// Annotation keys stamped onto resources the Workspace Controller owns.
pub mod annotations {
    pub const CREATED_BY: &str = "guildnet.io/created-by";
    pub const SPEC_HASH: &str = "guildnet.io/spec-hash";
}

pub fn signal_ready() {
    if let Ok(path) = std::env::var("READY_FILE_PATH") {
        let _ = std::fs::write(path, "ready");
    }
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);

    install_rustls_provider();
}

pub fn install_rustls_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install aws-lc-rs provider");
}

pub fn make_rustls(certs: Vec<CertificateDer<'_>>) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        roots.add(cert).unwrap();
    }
    for cert in certs {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

#[derive(Deserialize, Default, Clone, Debug)]
pub struct Pagination {
    #[serde(default, deserialize_with = "deserialize_i64_from_string_or_int")]
    pub offset: i64,

    #[serde(default, deserialize_with = "deserialize_opt_i64_from_string_or_int")]
    pub limit: Option<i64>,
}

fn deserialize_i64_from_string_or_int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct I64Visitor;

    impl<'de> Visitor<'de> for I64Visitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer or a string containing an integer")
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            i64::try_from(v).map_err(|_| E::custom("integer out of range"))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.trim()
                .parse::<i64>()
                .map_err(|e| E::custom(format!("invalid integer: {e}")))
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&v)
        }
    }

    deserializer.deserialize_any(I64Visitor)
}

fn deserialize_opt_i64_from_string_or_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OptI64Visitor;

    impl<'de> Visitor<'de> for OptI64Visitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an optional integer or a string containing an integer")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2>(self, deserializer: D2) -> Result<Self::Value, D2::Error>
        where
            D2: Deserializer<'de>,
        {
            deserialize_i64_from_string_or_int(deserializer).map(Some)
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(
                i64::try_from(v).map_err(|_| E::custom("integer out of range"))?,
            ))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|e| E::custom(format!("invalid integer: {e}")))
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&v)
        }
    }

    deserializer.deserialize_any(OptI64Visitor)
}

pub mod response {
    use std::fmt::{Debug, Display};

    use anyhow::Error;
    use axum::response::Response;

    use super::*;

    pub fn print_error<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "{}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn print_warning<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "{}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.yellow().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn err_resp<T>(e: T, code: StatusCode) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        let reason = format!("{}", e);
        print_error(e);
        (code, Json(serde_json::json!({"reason": reason}))).into_response()
    }

    pub fn not_found<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::NOT_FOUND)
    }

    pub fn conflict<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::CONFLICT)
    }

    pub fn internal_server_error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_gateway<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::BAD_GATEWAY)
    }

    pub fn bad_request<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::BAD_REQUEST)
    }

    pub fn forbidden<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::FORBIDDEN)
    }

    pub fn unauthorized<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::UNAUTHORIZED)
    }

    pub fn service_unavailable<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub mod access_log {
    use super::*;

    pub async fn public(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("MESH", req, next, false).await
    }

    pub async fn admin(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("ADMIN", req, next, false).await
    }

    pub async fn request(
        prefix: &str,
        req: axum::extract::Request,
        next: axum::middleware::Next,
        errors_only: bool,
    ) -> axum::response::Response {
        let ip = get_source_ip(req.headers())
            .map(|ip| ip.to_string())
            .unwrap_or("unknown".into());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();
        let is_success =
            response.status().is_success() || response.status() == StatusCode::SWITCHING_PROTOCOLS;
        if is_success && errors_only {
            return response;
        }
        let (a, b) = if is_success {
            ((20, 163, 73), (25, 163, 118))
        } else {
            ((230, 126, 16), (171, 85, 17))
        };
        println!(
            "{} {} {} {} {} {}{}{} {}{}",
            format!("[{}]", prefix).truecolor(a.0, a.1, a.2),
            method.truecolor(b.0, b.1, b.2),
            path.truecolor(b.0, b.1, b.2),
            "→".truecolor(a.0, a.1, a.2),
            response.status().truecolor(b.0, b.1, b.2),
            "(".truecolor(a.0, a.1, a.2),
            format!("{:?}", duration).truecolor(b.0, b.1, b.2),
            ")".truecolor(a.0, a.1, a.2),
            "xff=".magenta(),
            ip.magenta().dimmed(),
        );
        response
    }
}

pub fn get_source_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded_for) = headers.get("x-forwarded-for")
        && let Ok(forwarded_for) = forwarded_for.to_str()
        && let Some(ip_str) = forwarded_for.split(',').next()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(ip_str) = real_ip.to_str()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    None
}
