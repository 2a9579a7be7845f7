use bytes::{Buf, BufMut};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Magic word identifying a metadata record on disk.
pub const MD_MAGIC: u32 = 0x8365_731C;

/// On-disk record size: six big-endian 32-bit words.
pub const MD_RECORD_SIZE: usize = 24;

/// The five generation counters exchanged during the handshake. Their
/// lexicographic order decides which node holds the authoritative data after
/// a disconnect.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GenCounts {
    /// Administrator-driven promotions.
    pub human: u32,
    /// Ack-timeout events survived.
    pub timeout: u32,
    /// Successful reconnects.
    pub connected: u32,
    /// Crash-induced arbitrary promotions.
    pub arbitrary: u32,
    /// 1 while the node is Primary; written on every metadata update.
    pub primary_ind: u32,
}

impl GenCounts {
    pub fn initial() -> Self {
        GenCounts {
            human: 1,
            timeout: 1,
            connected: 1,
            arbitrary: 1,
            primary_ind: 0,
        }
    }

    pub fn as_words(&self) -> [u32; 5] {
        [
            self.human,
            self.timeout,
            self.connected,
            self.arbitrary,
            self.primary_ind,
        ]
    }

    pub fn from_words(words: [u32; 5]) -> Self {
        GenCounts {
            human: words[0],
            timeout: words[1],
            connected: words[2],
            arbitrary: words[3],
            primary_ind: words[4],
        }
    }

    fn encode(&self) -> [u8; MD_RECORD_SIZE] {
        let mut buf = [0u8; MD_RECORD_SIZE];
        {
            let mut w = &mut buf[..];
            for word in self.as_words() {
                w.put_u32(word);
            }
            w.put_u32(MD_MAGIC);
        }
        buf
    }

    fn decode(buf: &[u8; MD_RECORD_SIZE]) -> Option<Self> {
        let mut r = &buf[..];
        let words = [r.get_u32(), r.get_u32(), r.get_u32(), r.get_u32(), r.get_u32()];
        if r.get_u32() != MD_MAGIC {
            return None;
        }
        Some(GenCounts::from_words(words))
    }
}

/// Outcome of the lexicographic generation-count comparison.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Authority {
    IHaveGood,
    Tie,
    PeerHasGood,
}

pub fn compare(mine: &GenCounts, peer: &GenCounts) -> Authority {
    for (me, other) in mine.as_words().iter().zip(peer.as_words().iter()) {
        if me > other {
            return Authority::IHaveGood;
        }
        if me < other {
            return Authority::PeerHasGood;
        }
    }
    Authority::Tie
}

/// Life events that bump one generation counter each.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GenEvent {
    HumanIntervention,
    AckTimeout,
    Reconnect,
    ArbitraryPromotion,
}

/// MetadataStore persists the fixed-size record. `load` returns None for a
/// missing, short or magic-mismatched record; `store` must not return before
/// the record is durable.
pub trait MetadataStore: Send {
    fn load(&mut self) -> io::Result<Option<GenCounts>>;
    fn store(&mut self, counts: &GenCounts) -> io::Result<()>;
}

pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileMetadataStore { path: path.into() }
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&mut self) -> io::Result<Option<GenCounts>> {
        let mut fp = match fs::File::open(&self.path) {
            Ok(fp) => fp,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut buf = [0u8; MD_RECORD_SIZE];
        match fp.read_exact(&mut buf) {
            Ok(()) => Ok(GenCounts::decode(&buf)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&mut self, counts: &GenCounts) -> io::Result<()> {
        let mut fp = fs::File::create(&self.path)?;
        fp.write_all(&counts.encode())?;
        fp.sync_all()
    }
}

/// In-memory store for tests and volatile deployments.
#[derive(Default)]
pub struct VolatileMetadataStore {
    record: Option<[u8; MD_RECORD_SIZE]>,
}

impl VolatileMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for VolatileMetadataStore {
    fn load(&mut self) -> io::Result<Option<GenCounts>> {
        Ok(self.record.as_ref().and_then(GenCounts::decode))
    }

    fn store(&mut self, counts: &GenCounts) -> io::Result<()> {
        self.record = Some(counts.encode());
        Ok(())
    }
}

/// Metadata couples the persisted counters with the in-memory state needed
/// for sync decisions: the consistency flag and the generation snapshot the
/// bitmap was last known to be complete for.
pub struct Metadata {
    logger: slog::Logger,
    store: Box<dyn MetadataStore>,
    pub gen: GenCounts,
    pub bit_map_gen: [u32; 4],
    pub consistent: bool,
}

impl Metadata {
    /// Load the record; reinitialise counters to 1 and write back on a
    /// missing or corrupt record.
    pub fn read(logger: slog::Logger, mut store: Box<dyn MetadataStore>, primary: bool) -> io::Result<Self> {
        let gen = match store.load()? {
            Some(gen) => gen,
            None => {
                slog::error!(logger, "metadata record missing or corrupt, reinitialising");
                let mut gen = GenCounts::initial();
                gen.primary_ind = primary as u32;
                store.store(&gen)?;
                gen
            }
        };
        let bit_map_gen = [gen.human, gen.timeout, gen.connected, gen.arbitrary];
        Ok(Metadata {
            logger,
            store,
            gen,
            bit_map_gen,
            consistent: true,
        })
    }

    /// Rewrite the record, stamping the current role into `primary_ind`.
    pub fn write(&mut self, primary: bool) -> io::Result<()> {
        self.gen.primary_ind = primary as u32;
        self.store.store(&self.gen)
    }

    pub fn inc(&mut self, event: GenEvent) {
        match event {
            GenEvent::HumanIntervention => self.gen.human += 1,
            GenEvent::AckTimeout => self.gen.timeout += 1,
            GenEvent::Reconnect => self.gen.connected += 1,
            GenEvent::ArbitraryPromotion => self.gen.arbitrary += 1,
        }
    }

    /// Take a fresh bitmap-generation snapshot. Called when the replicas are
    /// known byte-identical (handshake with no resync, or resync finished).
    pub fn snapshot_bit_map_gen(&mut self) {
        self.bit_map_gen = [
            self.gen.human,
            self.gen.timeout,
            self.gen.connected,
            self.gen.arbitrary,
        ];
        slog::debug!(self.logger, "bitmap generation snapshot taken";
            "gen" => ?self.bit_map_gen);
    }

    /// Decide whether a bitmap-driven partial resync is sufficient, or a
    /// full resync is required.
    ///
    /// Partial is allowed only when (a) both sides are consistent, (b) the
    /// authoritative side shut down cleanly (its `primary_ind` is not 1) and
    /// (c) from the non-authoritative side's point of view, its bitmap
    /// generation matches the authoritative side's counters — i.e. its
    /// bitmap has tracked every difference since the replicas last agreed.
    /// (c) can only be evaluated by the non-authoritative node; the
    /// authoritative node assumes partial and relies on the peer to demand a
    /// full sync.
    pub fn syncq_ok(&self, peer: &GenCounts, peer_consistent: bool, who: Authority) -> bool {
        if !self.consistent || !peer_consistent {
            return false;
        }

        let authoritative_primary_ind = match who {
            Authority::IHaveGood => self.gen.primary_ind,
            Authority::PeerHasGood => peer.primary_ind,
            Authority::Tie => return true,
        };
        if authoritative_primary_ind == 1 {
            return false;
        }

        if who == Authority::PeerHasGood {
            let peer_words = peer.as_words();
            for i in 0..4 {
                if self.bit_map_gen[i] != peer_words[i] {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn gc(words: [u32; 5]) -> GenCounts {
        GenCounts::from_words(words)
    }

    #[test]
    fn record_roundtrip() {
        let mut store = VolatileMetadataStore::new();
        let counts = gc([3, 1, 7, 1, 1]);
        store.store(&counts).unwrap();
        assert_eq!(store.load().unwrap(), Some(counts));
    }

    #[test]
    fn file_store_roundtrip_and_corruption() {
        let dir = std::env::temp_dir().join(format!("blockmirror-md-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("md0");

        let mut store = FileMetadataStore::new(&path);
        assert_eq!(store.load().unwrap(), None);

        let counts = gc([2, 1, 5, 1, 0]);
        store.store(&counts).unwrap();
        assert_eq!(store.load().unwrap(), Some(counts));

        // Truncated record reads as absent.
        fs::write(&path, [0u8; 7]).unwrap();
        assert_eq!(store.load().unwrap(), None);

        // Wrong magic reads as absent.
        fs::write(&path, [0u8; MD_RECORD_SIZE]).unwrap();
        assert_eq!(store.load().unwrap(), None);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn read_reinitialises_corrupt_record() {
        let md = Metadata::read(discard(), Box::new(VolatileMetadataStore::new()), true).unwrap();
        assert_eq!(md.gen.human, 1);
        assert_eq!(md.gen.primary_ind, 1);
    }

    #[test]
    fn compare_is_lexicographic() {
        let a = gc([3, 0, 2, 0, 1]);
        let b = gc([3, 0, 1, 9, 9]);
        assert_eq!(compare(&a, &b), Authority::IHaveGood);
        assert_eq!(compare(&b, &a), Authority::PeerHasGood);
        assert_eq!(compare(&a, &a), Authority::Tie);
    }

    #[test]
    fn inconsistent_side_forces_full_sync() {
        let mut md = Metadata::read(discard(), Box::new(VolatileMetadataStore::new()), false).unwrap();
        md.gen = gc([3, 0, 2, 0, 1]);
        md.consistent = false;
        let peer = gc([3, 0, 2, 0, 1]);
        assert_eq!(compare(&md.gen, &peer), Authority::Tie);
        assert!(!md.syncq_ok(&peer, true, Authority::Tie));
    }

    #[test]
    fn crashed_primary_forces_full_sync() {
        let md = Metadata::read(discard(), Box::new(VolatileMetadataStore::new()), false).unwrap();
        let peer = gc([5, 1, 1, 1, 1]);
        assert!(!md.syncq_ok(&peer, true, Authority::PeerHasGood));
    }

    #[test]
    fn stale_bitmap_generation_forces_full_sync() {
        let mut md = Metadata::read(discard(), Box::new(VolatileMetadataStore::new()), false).unwrap();
        md.bit_map_gen = [1, 1, 1, 1];
        let peer = gc([2, 1, 1, 1, 0]);
        assert!(!md.syncq_ok(&peer, true, Authority::PeerHasGood));

        md.bit_map_gen = [2, 1, 1, 1];
        assert!(md.syncq_ok(&peer, true, Authority::PeerHasGood));
    }

    #[test]
    fn authoritative_side_assumes_partial() {
        let mut md = Metadata::read(discard(), Box::new(VolatileMetadataStore::new()), false).unwrap();
        md.gen = gc([4, 1, 1, 1, 0]);
        let peer = gc([2, 1, 1, 1, 0]);
        assert!(md.syncq_ok(&peer, true, Authority::IHaveGood));
    }
}
