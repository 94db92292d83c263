/*
 * Created on Wed Apr 10 2024
 *
 * This file is a part of Sable
 * Sable is a free and open-source Redis-compatible client runtime written
 * by Sayan Nandan ("the Author") with the vision to provide a fast, correct
 * and fully pipelined way to talk to modern key/value servers.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    super::tcp,
    crate::{cluster::NodeId, config::TlsOpts, error::SableResult},
    openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode},
    std::pin::Pin,
    tokio::net::TcpStream,
    tokio_openssl::SslStream,
};

/// Establish the TLS transport to one node. SNI and hostname verification
/// use the node's endpoint name
pub(super) async fn connect(node: &NodeId, opts: &TlsOpts) -> SableResult<SslStream<TcpStream>> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    if let Some(ca_file) = &opts.ca_file {
        builder.set_ca_file(ca_file)?;
    }
    if let (Some(cert_file), Some(key_file)) = (&opts.cert_file, &opts.key_file) {
        builder.set_certificate_chain_file(cert_file)?;
        builder.set_private_key_file(key_file, SslFiletype::PEM)?;
    }
    if opts.accept_invalid_certs {
        builder.set_verify(SslVerifyMode::NONE);
    }
    let connector = builder.build();
    let tcp = tcp::connect(node).await?;
    let ssl = connector.configure()?.into_ssl(node.endpoint())?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream).connect().await?;
    Ok(stream)
}
