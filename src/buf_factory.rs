// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Pooled buffers for packet and body handling.
//!
//! The crate maintains two [`buffer_pool::Pool`] instances for the lifetime of
//! the program: one sized for inbound UDP datagrams and the GSO send buffer,
//! and a generic one for buffered HTTP message bodies traveling between the
//! upstream connection and a backend.

use buffer_pool::ConsumeBuffer;
use buffer_pool::Pool;
use buffer_pool::Pooled;

const POOL_SHARDS: usize = 8;
const POOL_SIZE: usize = 16 * 1024;
const DATAGRAM_POOL_SIZE: usize = 64 * 1024;

const MAX_POOL_BUF_SIZE: usize = 64 * 1024;

/// Enough room for a full GSO batch of QUIC packets.
const MAX_DATAGRAM_SIZE: usize = 65535;

type BufPool = Pool<POOL_SHARDS, ConsumeBuffer>;

/// A generic buffer pool used to pass body data around without copying.
static BUF_POOL: BufPool =
    BufPool::new(POOL_SIZE, MAX_POOL_BUF_SIZE, "generic_pool");

/// A datagram pool for incoming QUIC packets and outbound packet batches.
static DATAGRAM_POOL: BufPool =
    BufPool::new(DATAGRAM_POOL_SIZE, MAX_DATAGRAM_SIZE, "datagram_pool");

/// A pooled byte buffer to pass stream data around without copying.
pub type PooledBuf = Pooled<ConsumeBuffer>;
/// A pooled byte buffer holding one (or a GSO batch of) UDP datagram(s).
pub type PooledDgram = Pooled<ConsumeBuffer>;

/// Handle to the crate's static buffer pools.
#[derive(Default, Clone, Debug)]
pub struct BufFactory;

impl BufFactory {
    /// The maximum size of the buffers in the generic pool. Larger buffers
    /// will shrink to this size before returning to the pool.
    pub const MAX_BUF_SIZE: usize = MAX_POOL_BUF_SIZE;
    /// The maximum size of the buffers in the datagram pool.
    pub const MAX_DGRAM_SIZE: usize = MAX_DATAGRAM_SIZE;

    /// Creates an empty [`PooledBuf`] which is not taken from the pool. When
    /// dropped, it may be assigned to the generic pool if no longer empty.
    pub fn get_empty_buf() -> PooledBuf {
        BUF_POOL.get_empty()
    }

    /// Fetches a `MAX_BUF_SIZE` sized [`PooledBuf`] from the generic pool.
    pub fn get_max_buf() -> PooledBuf {
        BUF_POOL.get_with(|d| d.expand(MAX_POOL_BUF_SIZE))
    }

    /// Fetches a `MAX_DGRAM_SIZE` sized [`PooledDgram`] from the datagram
    /// pool.
    pub fn get_max_datagram() -> PooledDgram {
        DATAGRAM_POOL.get_with(|d| d.expand(MAX_DATAGRAM_SIZE))
    }

    /// Fetches a [`PooledBuf`] from the generic pool and initializes it
    /// with the contents of `slice`.
    pub fn buf_from_slice(slice: &[u8]) -> PooledBuf {
        BUF_POOL.with_slice(slice)
    }
}
