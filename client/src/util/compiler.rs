/*
 * Created on Sun Mar 10 2024
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

//! Dark compiler arts and hackery to defy the normal. Use at your own
//! risk

#[cold]
#[inline(never)]
pub const fn cold() {}

pub const fn likely(b: bool) -> bool {
    if !b {
        cold()
    }
    b
}

pub const fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}

#[cold]
#[inline(never)]
pub fn cold_rerr<T, E>(e: E) -> Result<T, E> {
    Err(e)
}
