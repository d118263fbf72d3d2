use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{error, info};
use tokio::task::spawn_blocking;
use vblock_common::serializer::{Reader, ReaderError, Serializer, Writer};

use crate::config::SUPERBLOCK_MAGIC;

use super::state::Role;

pub const GEN_CNT_SIZE: usize = 5;

// Indices into the generation counter array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenIdx {
    // Zeroed while a sync is running; a crash mid-sync forces a full one
    Consistent = 0,
    // Bumped on operator-forced role changes
    HumanCnt = 1,
    // Bumped when a connection is established
    ConnectedCnt = 2,
    // Bumped on everything else worth fencing
    ArbitraryCnt = 3,
    // Whether the node was primary when the counters were written
    PrimaryInd = 4,
}

// The range of counters snapshot into the bitmap generation
const BITMAP_GEN_FIRST: usize = GenIdx::HumanCnt as usize;
const BITMAP_GEN_LAST: usize = GenIdx::ArbitraryCnt as usize;

// On-disk layout: u32 gen_cnt[5]; u32 magic; all big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub gen_cnt: [u32; GEN_CNT_SIZE],
}

impl Superblock {
    pub fn initial(role: Role) -> Self {
        let mut gen_cnt = [1u32; GEN_CNT_SIZE];
        gen_cnt[GenIdx::PrimaryInd as usize] = (role == Role::Primary) as u32;
        Self { gen_cnt }
    }

    // Lexicographic compare over the ordered counter tuple decides
    // which side has the good data
    pub fn compare(&self, peer: &[u32; GEN_CNT_SIZE]) -> Ordering {
        for i in 0..GEN_CNT_SIZE {
            match self.gen_cnt[i].cmp(&peer[i]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl Serializer for Superblock {
    fn write(&self, writer: &mut Writer) {
        for value in &self.gen_cnt {
            writer.write_u32(value);
        }
        writer.write_u32(&SUPERBLOCK_MAGIC);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut gen_cnt = [0u32; GEN_CNT_SIZE];
        for value in &mut gen_cnt {
            *value = reader.read_u32()?;
        }
        if reader.read_u32()? != SUPERBLOCK_MAGIC {
            return Err(ReaderError::InvalidValue);
        }
        Ok(Self { gen_cnt })
    }

    fn size(&self) -> usize {
        (GEN_CNT_SIZE + 1) * 4
    }
}

// Persistent generation counters for one device. Written durably on
// every state transition; the handshake consumes the counters to decide
// sync direction and depth.
pub struct MetaStore {
    path: PathBuf,
    state: Mutex<MetaState>,
}

struct MetaState {
    superblock: Superblock,
    // Counter snapshot taken when the bitmap was last written out;
    // compared against the peer's counters to allow a quick sync
    bitmap_gen: [u32; GEN_CNT_SIZE],
}

impl MetaStore {
    // Load the superblock, or initialize a fresh one if the file is
    // missing or corrupt (matching a first boot)
    pub fn load_or_init<P: AsRef<Path>>(path: P, role: Role) -> Self {
        let path = path.as_ref().to_path_buf();
        let superblock = match std::fs::read(&path) {
            Ok(bytes) => match Superblock::from_bytes(&bytes) {
                Ok(sb) => sb,
                Err(e) => {
                    error!("corrupt superblock {}: {}, reinitializing", path.display(), e);
                    Superblock::initial(role)
                }
            },
            Err(_) => {
                info!("no superblock at {}, initializing", path.display());
                Superblock::initial(role)
            }
        };
        let bitmap_gen = superblock.gen_cnt;
        Self {
            path,
            state: Mutex::new(MetaState {
                superblock,
                bitmap_gen,
            }),
        }
    }

    pub fn gen_cnt(&self) -> [u32; GEN_CNT_SIZE] {
        self.state.lock().expect("meta lock poisoned").superblock.gen_cnt
    }

    pub fn inc(&self, order: GenIdx) {
        let mut state = self.state.lock().expect("meta lock poisoned");
        state.superblock.gen_cnt[order as usize] += 1;
    }

    pub fn set_role(&self, role: Role) {
        let mut state = self.state.lock().expect("meta lock poisoned");
        state.superblock.gen_cnt[GenIdx::PrimaryInd as usize] = (role == Role::Primary) as u32;
    }

    pub fn compare(&self, peer: &[u32; GEN_CNT_SIZE]) -> Ordering {
        self.state
            .lock()
            .expect("meta lock poisoned")
            .superblock
            .compare(peer)
    }

    // Whether a quick (bitmap-driven) sync is sufficient, or the whole
    // device must be copied
    pub fn quick_sync_ok(&self, peer: &[u32; GEN_CNT_SIZE], have_good: bool) -> bool {
        let state = self.state.lock().expect("meta lock poisoned");
        let mine = &state.superblock.gen_cnt;

        // crash during sync forces a full sync
        if (have_good && peer[GenIdx::Consistent as usize] == 0)
            || (!have_good && mine[GenIdx::Consistent as usize] == 0)
        {
            return false;
        }

        // primary crash forces a full sync
        if (have_good && peer[GenIdx::PrimaryInd as usize] == 1)
            || (!have_good && mine[GenIdx::PrimaryInd as usize] == 1)
        {
            return false;
        }

        // a peer counter not matching our bitmap generation means the
        // bitmap no longer describes the divergence
        if have_good {
            for i in BITMAP_GEN_FIRST..=BITMAP_GEN_LAST {
                if state.bitmap_gen[i] != peer[i] {
                    return false;
                }
            }
        }

        true
    }

    // Write the superblock durably. Called on every state transition.
    pub async fn store(&self) -> io::Result<()> {
        let bytes = {
            let state = self.state.lock().expect("meta lock poisoned");
            state.superblock.to_bytes()
        };
        let path = self.path.clone();
        spawn_blocking(move || {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &bytes)?;
            let file = std::fs::OpenOptions::new().write(true).open(&tmp)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_layout() {
        let sb = Superblock {
            gen_cnt: [1, 2, 3, 4, 1],
        };
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), 24);
        // last word is the magic, big-endian
        assert_eq!(&bytes[20..], &SUPERBLOCK_MAGIC.to_be_bytes());
        assert_eq!(Superblock::from_bytes(&bytes).unwrap(), sb);
    }

    #[test]
    fn test_superblock_bad_magic() {
        let sb = Superblock::initial(Role::Secondary);
        let mut bytes = sb.to_bytes();
        bytes[23] ^= 0xFF;
        assert!(Superblock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_compare_lexicographic() {
        let sb = Superblock {
            gen_cnt: [1, 5, 1, 1, 0],
        };
        assert_eq!(sb.compare(&[1, 4, 9, 9, 9]), Ordering::Greater);
        assert_eq!(sb.compare(&[1, 5, 1, 1, 0]), Ordering::Equal);
        assert_eq!(sb.compare(&[2, 0, 0, 0, 0]), Ordering::Less);
    }

    #[tokio::test]
    async fn test_store_and_reload() {
        let dir = tempdir::TempDir::new("vblock-meta").unwrap();
        let path = dir.path().join("vol0.meta");

        let meta = MetaStore::load_or_init(&path, Role::Primary);
        meta.inc(GenIdx::ConnectedCnt);
        let before = meta.gen_cnt();
        meta.store().await.unwrap();

        let reloaded = MetaStore::load_or_init(&path, Role::Secondary);
        assert_eq!(reloaded.gen_cnt(), before);
    }

    #[test]
    fn test_quick_sync_rules() {
        let meta = MetaStore::load_or_init("/nonexistent/vblock.meta", Role::Secondary);
        let mine = meta.gen_cnt();

        // identical counters, nobody was primary: quick sync is fine
        let mut peer = mine;
        peer[GenIdx::PrimaryInd as usize] = 0;
        assert!(meta.quick_sync_ok(&peer, true));

        // peer crashed while primary: full sync
        peer[GenIdx::PrimaryInd as usize] = 1;
        assert!(!meta.quick_sync_ok(&peer, true));

        // bitmap generation mismatch: full sync
        peer[GenIdx::PrimaryInd as usize] = 0;
        peer[GenIdx::ArbitraryCnt as usize] += 1;
        assert!(!meta.quick_sync_ok(&peer, true));

        // peer crashed mid-sync: full sync
        let mut peer = mine;
        peer[GenIdx::Consistent as usize] = 0;
        assert!(!meta.quick_sync_ok(&peer, true));
    }
}
