//! Binary registry and symbol resolution
//!
//! Tracks registered code binaries in two tiers: a hot map of fully parsed
//! binaries and a cold cache of deferred ones that are promoted on first
//! use. Also resolves runtime PCs against a binary's sorted symbol table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{AnalyzerError, Result};
use crate::instruction::{parse_instruction_listing, InstructionGraph, Symbol};

/// A registered code binary: sorted symbols plus its instruction graph
#[derive(Debug, Default)]
pub struct Binary {
    /// Identifier assigned by the instrumentation layer
    pub cubin_id: u32,
    /// Path the binary was registered under
    pub path: PathBuf,
    /// Function symbols sorted by runtime pc
    pub symbols: Vec<Symbol>,
    /// Def→use graph of the companion instruction listing
    pub graph: InstructionGraph,
}

/// A deferred binary awaiting promotion
#[derive(Debug, Clone)]
struct CachedBinary {
    symbol_pcs: Vec<u64>,
    path: PathBuf,
}

/// Two-tier registry of binaries keyed by cubin id
#[derive(Debug, Default)]
pub struct BinaryRegistry {
    binaries: DashMap<u32, Arc<Binary>>,
    cache: DashMap<u32, CachedBinary>,
}

/// Resolve `pc` against a sorted symbol table.
///
/// The owning symbol is the one with the largest `pc` not above the query;
/// returns `(function_index, cubin_offset, pc_offset)`.
pub fn transform_pc(symbols: &[Symbol], pc: u64) -> Result<(u32, u64, u64)> {
    let idx = symbols.partition_point(|s| s.pc <= pc);
    if idx == 0 {
        return Err(AnalyzerError::NotExistEntry(format!("pc {:#x}", pc)));
    }
    let symbol = &symbols[idx - 1];
    let pc_offset = pc - symbol.pc;
    let cubin_offset = symbol.cubin_offset + pc_offset;
    Ok((symbol.function_index, cubin_offset, pc_offset))
}

/// Companion instruction listing for a binary at `path`:
/// `<grandparent>/structs/nvidia/<file_name>.inst`
fn companion_listing_path(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let grandparent = path.parent()?.parent()?;
    let mut name = file_name.to_os_string();
    name.push(".inst");
    Some(grandparent.join("structs").join("nvidia").join(name))
}

impl BinaryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binary, parsing its companion instruction listing.
    ///
    /// A missing listing is reported as `NoSuchFile` but the binary is still
    /// inserted with an empty graph, so analysis can run in fallback mode. A
    /// listing that fails to parse rejects the registration entirely.
    pub fn register(&self, cubin_id: u32, symbol_pcs: &[u64], path: &Path) -> Result<()> {
        tracing::debug!(cubin_id, path = %path.display(), "registering binary");

        let listing = companion_listing_path(path).filter(|p| p.exists());
        let (mut symbols, graph, missing) = match listing {
            Some(listing_path) => {
                let text = std::fs::read_to_string(&listing_path)?;
                let (symbols, graph) = parse_instruction_listing(&text)?;
                if symbols.len() != symbol_pcs.len() {
                    return Err(AnalyzerError::FailedAnalyzeBinary(format!(
                        "{} symbols in listing, {} pcs supplied",
                        symbols.len(),
                        symbol_pcs.len()
                    )));
                }
                (symbols, graph, None)
            }
            None => {
                // Fallback template: positional indexes, no graph
                let symbols = (0..symbol_pcs.len())
                    .map(|i| Symbol::new(i as u32, 0, 0))
                    .collect();
                let missing =
                    companion_listing_path(path).unwrap_or_else(|| path.to_path_buf());
                (symbols, InstructionGraph::new(), Some(missing))
            }
        };

        for (symbol, &pc) in symbols.iter_mut().zip(symbol_pcs) {
            symbol.pc = pc;
        }
        symbols.sort_by_key(|s| s.pc);

        let binary = Arc::new(Binary {
            cubin_id,
            path: path.to_path_buf(),
            symbols,
            graph,
        });

        match self.binaries.entry(cubin_id) {
            Entry::Occupied(_) => {
                return Err(AnalyzerError::DuplicateEntry(format!("cubin {}", cubin_id)))
            }
            Entry::Vacant(slot) => {
                slot.insert(binary);
            }
        }

        match missing {
            Some(listing_path) => Err(AnalyzerError::NoSuchFile(listing_path)),
            None => Ok(()),
        }
    }

    /// Record a binary for lazy registration on first use
    pub fn register_cache(&self, cubin_id: u32, symbol_pcs: &[u64], path: &Path) -> Result<()> {
        tracing::debug!(cubin_id, path = %path.display(), "caching binary");

        match self.cache.entry(cubin_id) {
            Entry::Occupied(_) => Err(AnalyzerError::DuplicateEntry(format!("cubin {}", cubin_id))),
            Entry::Vacant(slot) => {
                slot.insert(CachedBinary {
                    symbol_pcs: symbol_pcs.to_vec(),
                    path: path.to_path_buf(),
                });
                Ok(())
            }
        }
    }

    /// Drop a registered binary
    pub fn unregister(&self, cubin_id: u32) -> Result<()> {
        tracing::debug!(cubin_id, "unregistering binary");

        self.binaries
            .remove(&cubin_id)
            .map(|_| ())
            .ok_or_else(|| AnalyzerError::NotExistEntry(format!("cubin {}", cubin_id)))
    }

    /// Fetch a binary, promoting it from the lazy cache if needed.
    ///
    /// The returned `Arc` keeps the binary alive across a decoding step even
    /// if it is unregistered concurrently.
    pub fn resolve(&self, cubin_id: u32) -> Result<Arc<Binary>> {
        if let Some(binary) = self.binaries.get(&cubin_id) {
            return Ok(Arc::clone(binary.value()));
        }

        let cached = self
            .cache
            .get(&cubin_id)
            .map(|entry| entry.value().clone());
        if let Some(cached) = cached {
            match self.register(cubin_id, &cached.symbol_pcs, &cached.path) {
                // The binary is inserted even without its listing; a racing
                // promotion surfaces as a duplicate and is equally fine.
                Ok(()) | Err(AnalyzerError::NoSuchFile(_)) | Err(AnalyzerError::DuplicateEntry(_)) => {}
                Err(err) => return Err(err),
            }
            if let Some(binary) = self.binaries.get(&cubin_id) {
                return Ok(Arc::clone(binary.value()));
            }
        }

        Err(AnalyzerError::NotExistEntry(format!("cubin {}", cubin_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    const LISTING: &str = "\
sym 0 0x0
sym 1 0x100
inst 0x0 LDG.E.F32 dst=R4
inst 0x10 STG.E.F32 src=R4 assign=R4:0x0
";

    /// Lay out `<dir>/cubins/<name>` and its companion listing, returning
    /// the binary path.
    fn write_binary(dir: &Path, name: &str, listing: Option<&str>) -> PathBuf {
        let cubins = dir.join("cubins");
        fs::create_dir_all(&cubins).unwrap();
        let path = cubins.join(name);
        fs::write(&path, b"\x7fELF").unwrap();
        if let Some(text) = listing {
            let structs = dir.join("structs").join("nvidia");
            fs::create_dir_all(&structs).unwrap();
            fs::write(structs.join(format!("{}.inst", name)), text).unwrap();
        }
        path
    }

    #[test]
    fn test_transform_pc() {
        let symbols = vec![Symbol::new(0, 0x0, 0x1000), Symbol::new(1, 0x800, 0x2000)];
        assert_eq!(transform_pc(&symbols, 0x1000).unwrap(), (0, 0x0, 0x0));
        assert_eq!(transform_pc(&symbols, 0x1010).unwrap(), (0, 0x10, 0x10));
        assert_eq!(transform_pc(&symbols, 0x2040).unwrap(), (1, 0x840, 0x40));
        assert!(transform_pc(&symbols, 0xfff).is_err());
    }

    // For any symbol and offset below the next symbol, resolution returns
    // the owning symbol with matching offsets.
    #[test]
    fn test_transform_pc_offsets() {
        let symbols = vec![Symbol::new(3, 0x40, 0x7000), Symbol::new(7, 0x900, 0x7800)];
        for delta in [0u64, 1, 0x7ff] {
            let (index, cubin_offset, pc_offset) =
                transform_pc(&symbols, 0x7000 + delta).unwrap();
            assert_eq!(index, 3);
            assert_eq!(pc_offset, delta);
            assert_eq!(cubin_offset, 0x40 + delta);
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binary(dir.path(), "k.cubin", Some(LISTING));

        let registry = BinaryRegistry::new();
        registry.register(7, &[0x1000, 0x2000], &path).unwrap();

        let binary = registry.resolve(7).unwrap();
        assert_eq!(binary.symbols.len(), 2);
        assert_eq!(binary.symbols[0].pc, 0x1000);
        assert_eq!(binary.graph.len(), 2);
    }

    #[test]
    fn test_missing_listing_still_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binary(dir.path(), "k.cubin", None);

        let registry = BinaryRegistry::new();
        let err = registry.register(7, &[0x1000], &path).unwrap_err();
        assert!(matches!(err, AnalyzerError::NoSuchFile(_)));

        let binary = registry.resolve(7).unwrap();
        assert!(binary.graph.is_empty());
        assert_eq!(binary.symbols[0].function_index, 0);
        assert_eq!(binary.symbols[0].pc, 0x1000);
    }

    #[test]
    fn test_parse_failure_not_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binary(dir.path(), "k.cubin", Some("inst zzz BAD\n"));

        let registry = BinaryRegistry::new();
        assert!(matches!(
            registry.register(7, &[0x1000], &path),
            Err(AnalyzerError::FailedAnalyzeBinary(_))
        ));
        assert!(registry.resolve(7).is_err());
    }

    #[test]
    fn test_duplicate_register() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binary(dir.path(), "k.cubin", Some(LISTING));

        let registry = BinaryRegistry::new();
        registry.register(7, &[0x1000, 0x2000], &path).unwrap();
        assert!(matches!(
            registry.register(7, &[0x1000, 0x2000], &path),
            Err(AnalyzerError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn test_cache_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binary(dir.path(), "k.cubin", Some(LISTING));

        let registry = BinaryRegistry::new();
        registry.register_cache(9, &[0x1000, 0x2000], &path).unwrap();

        let binary = registry.resolve(9).unwrap();
        assert_eq!(binary.cubin_id, 9);
        assert_eq!(binary.symbols.len(), 2);
        // Promotion fills the hot tier
        assert!(registry.binaries.contains_key(&9));
    }

    #[test]
    fn test_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_binary(dir.path(), "k.cubin", Some(LISTING));

        let registry = BinaryRegistry::new();
        registry.register(7, &[0x1000, 0x2000], &path).unwrap();
        registry.unregister(7).unwrap();
        assert!(matches!(
            registry.unregister(7),
            Err(AnalyzerError::NotExistEntry(_))
        ));
        assert!(registry.resolve(7).is_err());
    }
}
