/// 监听器的 TLS 配置装载
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::NetError;

/// 从 PEM 证书链与私钥文件构建 rustls 服务端配置
pub(crate) fn load_tls_config(
    cert_file: &Path,
    key_file: &Path,
) -> Result<rustls::ServerConfig, NetError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or_else(|| NetError::config("key_file", "no private key found"))?;

    Ok(rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}
