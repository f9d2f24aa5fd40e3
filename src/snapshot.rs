//! Persisted snapshot format (§11, elaborating §6 "Persisted state"):
//! CODE bytes, the interned STRING table, and the compiler's CP/BP_code
//! registers. Symbols and DATA_STACK/RETURN_STACK/GLOBAL contents are not
//! part of the durable artifact (§3.6: symbols persist for the VM's
//! lifetime, but are re-registered by the built-in init routine, not
//! serialized).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::VmConfig;
use crate::digest::Digest;
use crate::error::{VmError, VmResult};
use crate::memory::{Memory, Segment};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub config: VmConfig,
    pub code: Vec<u8>,
    pub strings: Vec<Vec<u8>>,
    pub cp: u16,
    pub bp_code: u16,
}

impl Snapshot {
    pub fn capture(
        config: VmConfig,
        memory: &Memory,
        digest: &Digest,
        cp: u16,
        bp_code: u16,
    ) -> Snapshot {
        Snapshot {
            config,
            code: memory.code_bytes().to_vec(),
            strings: digest.iter().map(|s| s.to_vec()).collect(),
            cp,
            bp_code,
        }
    }

    /// Rebuild a fresh CODE segment and digest from this snapshot. Callers
    /// re-register built-in words into the returned digest/symbol-table
    /// pair themselves (`builtins::register_builtins`), the same way a
    /// fresh `Vm::new` does.
    pub fn restore(&self) -> VmResult<(Memory, Digest)> {
        let mut memory = Memory::new(&self.config);
        for (i, &byte) in self.code.iter().enumerate() {
            memory.write8(Segment::Code, i, byte)?;
        }
        let digest = Digest::from_strings(&self.strings, self.config.string_bytes)?;
        Ok((memory, digest))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> VmResult<()> {
        let bytes = bincode::serialize(self).map_err(|e| VmError::Io(e.to_string()))?;
        fs::write(path, bytes).map_err(|e| VmError::Io(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> VmResult<Snapshot> {
        let bytes = fs::read(path).map_err(|e| VmError::Io(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| VmError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_then_restore_round_trips_code_and_strings() {
        let config = VmConfig::default();
        let mut memory = Memory::new(&config);
        memory.write8(Segment::Code, 0, 0xAB).unwrap();
        memory.write8(Segment::Code, 1, 0xCD).unwrap();
        let mut digest = Digest::new(config.string_bytes);
        digest.add(b"greeting").unwrap();

        let snap = Snapshot::capture(config, &memory, &digest, 2, 0);
        assert_eq!(snap.code, vec![0xAB, 0xCD]);
        assert_eq!(snap.strings, vec![b"greeting".to_vec()]);

        let (restored_memory, restored_digest) = snap.restore().unwrap();
        assert_eq!(restored_memory.code_bytes(), &[0xAB, 0xCD]);
        assert_eq!(restored_digest.get(0).unwrap(), b"greeting");
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let config = VmConfig::default();
        let memory = Memory::new(&config);
        let digest = Digest::new(config.string_bytes);
        let snap = Snapshot::capture(config, &memory, &digest, 0, 0);

        let mut path = std::env::temp_dir();
        path.push("tacit-snapshot-round-trip-test.bin");
        snap.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded.cp, snap.cp);
        assert_eq!(loaded.code, snap.code);
        let _ = fs::remove_file(&path);
    }
}
