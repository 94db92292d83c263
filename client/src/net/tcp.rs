/*
 * Created on Tue Apr 02 2024
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
    crate::{cluster::NodeId, error::SableResult},
    tokio::net::TcpStream,
};

/// Establish the plain TCP transport to one node
pub(super) async fn connect(node: &NodeId) -> SableResult<TcpStream> {
    let stream = TcpStream::connect((node.endpoint(), node.port())).await?;
    Ok(stream)
}
