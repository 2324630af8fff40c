use std::collections::BTreeMap;

use crc::{Crc, CRC_64_GO_ISO};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{Result, SharaqError};

/// Points per server on the hash continuum. Enough that adding one
/// server moves roughly its fair share of keys and nothing more.
const VIRTUAL_POINTS: usize = 160;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Consistent-hash ring over an ordered list of redis servers. Keys are
/// routed deterministically so cache locality survives adding servers
/// one at a time.
pub(super) struct RedisRing {
    nodes: Vec<redis::Client>,
    ring: BTreeMap<u64, usize>,
}

impl RedisRing {
    pub(super) fn new(servers: &[String]) -> Result<Self> {
        if servers.is_empty() {
            return Err(SharaqError::Config("urlcache: no redis servers".into()));
        }

        let mut servers = servers.to_vec();
        servers.sort();

        let mut nodes = Vec::with_capacity(servers.len());
        let mut ring = BTreeMap::new();
        for (i, addr) in servers.iter().enumerate() {
            let client = redis::Client::open(format!("redis://{}", addr))?;
            for point in 0..VIRTUAL_POINTS {
                let hash = CRC64.checksum(format!("server{}-{}", i + 1, point).as_bytes());
                ring.insert(hash, i);
            }
            nodes.push(client);
        }

        Ok(Self { nodes, ring })
    }

    fn node_index(&self, key: &str) -> usize {
        let hash = CRC64.checksum(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &i)| i)
            .unwrap_or(0)
    }

    async fn conn(&self, key: &str) -> Result<MultiplexedConnection> {
        let client = &self.nodes[self.node_index(key)];
        Ok(client.get_multiplexed_async_connection().await?)
    }

    pub(super) async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn(key).await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    pub(super) async fn set(&self, key: &str, value: &[u8], expires: u32) -> Result<()> {
        let mut conn = self.conn(key).await?;
        let _: () = conn.set_ex(key, value, expires as u64).await?;
        Ok(())
    }

    pub(super) async fn set_nx(&self, key: &str, value: &[u8], expires: u32) -> Result<()> {
        let mut conn = self.conn(key).await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(expires as u64)
            .query_async(&mut conn)
            .await?;
        if set.is_none() {
            return Err(SharaqError::Contention);
        }
        Ok(())
    }

    pub(super) async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn(key).await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
