use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use memmap2::Mmap;
use ring::digest::{Context, SHA256};

use stackpulse_wire::{FunctionMsg, StatementMsg, SymbolTableMsg};

use crate::address::{Address, AddressRange};
use crate::bitmap::AddressBitmap;

/// Identifier of a function or statement within one symbol table. Identifiers
/// are dense from 0 in insertion order and never reused.
pub type UniqueId = u32;

/// Bidirectional multimap between address ranges and entity identifiers.
///
/// Two sorted maps kept in lockstep. Point and overlap queries only scan keys
/// whose begin lies within the largest inserted width of the probe, so lookup
/// cost is bounded by the number of ranges near the address rather than the
/// table size.
#[derive(Clone, Debug, Default)]
struct RangeIndex {
    by_range: BTreeMap<AddressRange, BTreeSet<UniqueId>>,
    by_id: BTreeMap<UniqueId, BTreeSet<AddressRange>>,
    max_width: u64,
}

impl RangeIndex {
    fn insert(&mut self, range: AddressRange, uid: UniqueId) {
        if range.is_empty() {
            return;
        }
        self.by_range.entry(range).or_default().insert(uid);
        self.by_id.entry(uid).or_default().insert(range);
        self.max_width = self.max_width.max(range.width());
    }

    fn remove_entity(&mut self, uid: UniqueId) {
        let Some(ranges) = self.by_id.remove(&uid) else {
            return;
        };
        for range in ranges {
            if let Some(ids) = self.by_range.get_mut(&range) {
                ids.remove(&uid);
                if ids.is_empty() {
                    self.by_range.remove(&range);
                }
            }
        }
    }

    fn ranges_of(&self, uid: UniqueId) -> BTreeSet<AddressRange> {
        self.by_id.get(&uid).cloned().unwrap_or_default()
    }

    fn ids_at(&self, address: Address) -> BTreeSet<UniqueId> {
        self.ids_intersecting(&AddressRange::new(address, address + 1))
    }

    fn ids_intersecting(&self, query: &AddressRange) -> BTreeSet<UniqueId> {
        let mut ids = BTreeSet::new();
        if self.max_width == 0 || query.is_empty() {
            return ids;
        }
        let lo = Address::new(query.begin().value().saturating_sub(self.max_width - 1));
        let lo_key = AddressRange::new(lo, lo);
        for (range, entities) in self.by_range.range(lo_key..) {
            if range.begin() >= query.end() {
                break;
            }
            if range.intersects(query) {
                ids.extend(entities.iter().copied());
            }
        }
        ids
    }
}

#[derive(Clone, Debug)]
struct FunctionItem {
    name: String,
    bitmaps: Vec<AddressBitmap>,
}

#[derive(Clone, Debug)]
struct StatementItem {
    path: PathBuf,
    line: u32,
    column: u32,
    bitmaps: Vec<AddressBitmap>,
}

/// Symbol table for a single executable or shared library.
///
/// Holds the functions and statements of one binary keyed by dense
/// identifiers, with range indices answering "which entities cover this
/// address". Built either from the binary itself (checksum computed from its
/// bytes) or from a wire message (checksum preserved verbatim). Not designed
/// for concurrent mutation; builders own the table exclusively until it is
/// published.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    path: PathBuf,
    checksum: u64,
    functions: Vec<FunctionItem>,
    functions_index: RangeIndex,
    statements: Vec<StatementItem>,
    statements_index: RangeIndex,
}

impl SymbolTable {
    /// Creates an empty symbol table for the binary at `path`, computing its
    /// checksum from the file bytes.
    pub fn new(path: &Path) -> Result<Self> {
        Ok(SymbolTable {
            path: path.to_path_buf(),
            checksum: checksum_of(path)?,
            functions: Vec::new(),
            functions_index: RangeIndex::default(),
            statements: Vec::new(),
            statements_index: RangeIndex::default(),
        })
    }

    /// Restores a symbol table from its wire form, rebuilding the range
    /// indices from the bitmaps. The checksum is taken from the message, not
    /// recomputed.
    pub fn from_message(message: &SymbolTableMsg) -> Self {
        let mut table = SymbolTable {
            path: PathBuf::from(&message.path),
            checksum: message.checksum,
            functions: Vec::new(),
            functions_index: RangeIndex::default(),
            statements: Vec::new(),
            statements_index: RangeIndex::default(),
        };

        for function in &message.functions {
            let uid = table.functions.len() as UniqueId;
            table.functions.push(FunctionItem {
                name: function.name.clone(),
                bitmaps: function.bitmaps.iter().map(AddressBitmap::from_message).collect(),
            });
            table.reindex_function(uid);
        }
        for statement in &message.statements {
            let uid = table.statements.len() as UniqueId;
            table.statements.push(StatementItem {
                path: PathBuf::from(&statement.path),
                line: statement.line,
                column: statement.column,
                bitmaps: statement.bitmaps.iter().map(AddressBitmap::from_message).collect(),
            });
            table.reindex_statement(uid);
        }

        table
    }

    pub fn to_message(&self) -> SymbolTableMsg {
        SymbolTableMsg {
            path: self.path.to_string_lossy().into_owned(),
            checksum: self.checksum,
            functions: self
                .functions
                .iter()
                .map(|f| FunctionMsg {
                    name: f.name.clone(),
                    bitmaps: f.bitmaps.iter().map(AddressBitmap::to_message).collect(),
                })
                .collect(),
            statements: self
                .statements
                .iter()
                .map(|s| StatementMsg {
                    path: s.path.to_string_lossy().into_owned(),
                    line: s.line,
                    column: s.column,
                    bitmaps: s.bitmaps.iter().map(AddressBitmap::to_message).collect(),
                })
                .collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn add_function(&mut self, name: &str) -> UniqueId {
        let uid = self.functions.len() as UniqueId;
        self.functions.push(FunctionItem {
            name: name.to_string(),
            bitmaps: Vec::new(),
        });
        uid
    }

    pub fn add_statement(&mut self, path: &Path, line: u32, column: u32) -> UniqueId {
        let uid = self.statements.len() as UniqueId;
        self.statements.push(StatementItem {
            path: path.to_path_buf(),
            line,
            column,
            bitmaps: Vec::new(),
        });
        uid
    }

    /// Merges the given address ranges into the function's bitmaps and
    /// refreshes its index entries. Adjacent or overlapping input ranges are
    /// coalesced first; each coalesced group either lands in an existing
    /// bitmap whose range covers it or gets a bitmap of its own.
    pub fn add_function_address_ranges(&mut self, uid: UniqueId, ranges: &[AddressRange]) {
        let index = checked_index(uid, self.functions.len(), "function");
        let item = &mut self.functions[index];
        merge_ranges(&mut item.bitmaps, ranges);
        self.reindex_function(uid);
    }

    pub fn add_statement_address_ranges(&mut self, uid: UniqueId, ranges: &[AddressRange]) {
        let index = checked_index(uid, self.statements.len(), "statement");
        let item = &mut self.statements[index];
        merge_ranges(&mut item.bitmaps, ranges);
        self.reindex_statement(uid);
    }

    /// Deep-copies a function from another table, assigning a fresh
    /// identifier here.
    pub fn clone_function(&mut self, source: &SymbolTable, uid: UniqueId) -> UniqueId {
        let item = source.functions[checked_index(uid, source.functions.len(), "function")].clone();
        let new_uid = self.functions.len() as UniqueId;
        self.functions.push(item);
        self.reindex_function(new_uid);
        new_uid
    }

    pub fn clone_statement(&mut self, source: &SymbolTable, uid: UniqueId) -> UniqueId {
        let item =
            source.statements[checked_index(uid, source.statements.len(), "statement")].clone();
        let new_uid = self.statements.len() as UniqueId;
        self.statements.push(item);
        self.reindex_statement(new_uid);
        new_uid
    }

    pub fn function_mangled_name(&self, uid: UniqueId) -> &str {
        &self.functions[checked_index(uid, self.functions.len(), "function")].name
    }

    /// The function's addresses as the sorted set of contiguous runs across
    /// all its bitmaps. Empty if no ranges were ever added.
    pub fn function_address_ranges(&self, uid: UniqueId) -> BTreeSet<AddressRange> {
        checked_index(uid, self.functions.len(), "function");
        self.functions_index.ranges_of(uid)
    }

    pub fn statement_path(&self, uid: UniqueId) -> &Path {
        &self.statements[checked_index(uid, self.statements.len(), "statement")].path
    }

    pub fn statement_line(&self, uid: UniqueId) -> u32 {
        self.statements[checked_index(uid, self.statements.len(), "statement")].line
    }

    pub fn statement_column(&self, uid: UniqueId) -> u32 {
        self.statements[checked_index(uid, self.statements.len(), "statement")].column
    }

    pub fn statement_address_ranges(&self, uid: UniqueId) -> BTreeSet<AddressRange> {
        checked_index(uid, self.statements.len(), "statement");
        self.statements_index.ranges_of(uid)
    }

    /// Visits every function in identifier order until the visitor returns
    /// false.
    pub fn visit_functions(&self, mut visitor: impl FnMut(UniqueId) -> bool) {
        for uid in 0..self.functions.len() as UniqueId {
            if !visitor(uid) {
                return;
            }
        }
    }

    /// Visits every function whose contiguous runs contain `address`. There
    /// may be several, e.g. overlapping inlined instances.
    pub fn visit_functions_at(&self, address: Address, mut visitor: impl FnMut(UniqueId) -> bool) {
        for uid in self.functions_index.ids_at(address) {
            if !visitor(uid) {
                return;
            }
        }
    }

    pub fn visit_functions_by_name(&self, name: &str, mut visitor: impl FnMut(UniqueId) -> bool) {
        for (index, function) in self.functions.iter().enumerate() {
            if function.name == name && !visitor(index as UniqueId) {
                return;
            }
        }
    }

    pub fn visit_statements(&self, mut visitor: impl FnMut(UniqueId) -> bool) {
        for uid in 0..self.statements.len() as UniqueId {
            if !visitor(uid) {
                return;
            }
        }
    }

    pub fn visit_statements_at(&self, address: Address, mut visitor: impl FnMut(UniqueId) -> bool) {
        for uid in self.statements_index.ids_at(address) {
            if !visitor(uid) {
                return;
            }
        }
    }

    pub fn visit_statements_by_source_file(
        &self,
        path: &Path,
        mut visitor: impl FnMut(UniqueId) -> bool,
    ) {
        for (index, statement) in self.statements.iter().enumerate() {
            if statement.path == path && !visitor(index as UniqueId) {
                return;
            }
        }
    }

    /// Visits the statements whose runs intersect any of the function's runs.
    pub fn visit_function_statements(
        &self,
        uid: UniqueId,
        mut visitor: impl FnMut(UniqueId) -> bool,
    ) {
        let mut seen = BTreeSet::new();
        for range in self.function_address_ranges(uid) {
            seen.extend(self.statements_index.ids_intersecting(&range));
        }
        for statement in seen {
            if !visitor(statement) {
                return;
            }
        }
    }

    /// Visits the statements containing the function's entry (lowest)
    /// address, i.e. its definitions.
    pub fn visit_function_definitions(
        &self,
        uid: UniqueId,
        mut visitor: impl FnMut(UniqueId) -> bool,
    ) {
        let Some(first) = self.function_address_ranges(uid).into_iter().next() else {
            return;
        };
        for statement in self.statements_index.ids_at(first.begin()) {
            if !visitor(statement) {
                return;
            }
        }
    }

    /// Visits the functions whose runs intersect any of the statement's runs.
    pub fn visit_statement_functions(
        &self,
        uid: UniqueId,
        mut visitor: impl FnMut(UniqueId) -> bool,
    ) {
        let mut seen = BTreeSet::new();
        for range in self.statement_address_ranges(uid) {
            seen.extend(self.functions_index.ids_intersecting(&range));
        }
        for function in seen {
            if !visitor(function) {
                return;
            }
        }
    }

    fn reindex_function(&mut self, uid: UniqueId) {
        self.functions_index.remove_entity(uid);
        for bitmap in &self.functions[uid as usize].bitmaps {
            for run in bitmap.contiguous_ranges(true) {
                self.functions_index.insert(run, uid);
            }
        }
    }

    fn reindex_statement(&mut self, uid: UniqueId) {
        self.statements_index.remove_entity(uid);
        for bitmap in &self.statements[uid as usize].bitmaps {
            for run in bitmap.contiguous_ranges(true) {
                self.statements_index.insert(run, uid);
            }
        }
    }
}

fn checked_index(uid: UniqueId, len: usize, kind: &str) -> usize {
    assert!((uid as usize) < len, "unknown {kind} identifier {uid}");
    uid as usize
}

/// Folds new address ranges into an entity's bitmap list.
fn merge_ranges(bitmaps: &mut Vec<AddressBitmap>, ranges: &[AddressRange]) {
    let mut sorted: Vec<AddressRange> = ranges.iter().filter(|r| !r.is_empty()).copied().collect();
    sorted.sort();

    // Coalesce adjacent and overlapping inputs into groups.
    let mut groups: Vec<AddressRange> = Vec::new();
    for range in sorted {
        match groups.last_mut() {
            Some(last) if range.begin() <= last.end() => {
                if range.end() > last.end() {
                    *last = AddressRange::new(last.begin(), range.end());
                }
            }
            _ => groups.push(range),
        }
    }

    for group in groups {
        match bitmaps.iter_mut().find(|b| b.range().contains_range(&group)) {
            Some(bitmap) => set_range(bitmap, &group),
            None => {
                let mut bitmap = AddressBitmap::new(group);
                set_range(&mut bitmap, &group);
                bitmaps.push(bitmap);
            }
        }
    }
}

fn set_range(bitmap: &mut AddressBitmap, range: &AddressRange) {
    for offset in 0..range.width() {
        bitmap.set(range.begin() + offset, true);
    }
}

/// 64-bit checksum of a binary's bytes: the first 8 bytes, little-endian, of
/// the SHA-256 digest over the whole file.
fn checksum_of(path: &Path) -> Result<u64> {
    let file = fs::File::open(path)?;
    let mut context = Context::new(&SHA256);
    if file.metadata()?.len() > 0 {
        let mmap = unsafe { Mmap::map(&file) }?;
        context.update(&mmap);
    }
    let digest = context.finish();
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&digest.as_ref()[..8]);
    Ok(u64::from_le_bytes(buffer))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn range(begin: u64, end: u64) -> AddressRange {
        AddressRange::new(Address::new(begin), Address::new(end))
    }

    fn empty_table() -> SymbolTable {
        SymbolTable::from_message(&SymbolTableMsg {
            path: "/usr/lib/libexample.so".into(),
            checksum: 0x1122_3344_5566_7788,
            functions: vec![],
            statements: vec![],
        })
    }

    fn functions_at(table: &SymbolTable, address: u64) -> Vec<UniqueId> {
        let mut visited = Vec::new();
        table.visit_functions_at(Address::new(address), |uid| {
            visited.push(uid);
            true
        });
        visited
    }

    #[test]
    fn test_identifiers_are_dense() {
        let mut table = empty_table();
        assert_eq!(table.add_function("f"), 0);
        assert_eq!(table.add_function("g"), 1);
        assert_eq!(table.add_statement(Path::new("/src/a.c"), 1, 1), 0);
        assert_eq!(table.add_statement(Path::new("/src/b.c"), 2, 1), 1);
        assert_eq!(table.add_function("h"), 2);
    }

    #[test]
    fn test_lookup_by_address() {
        let mut table = empty_table();
        let f = table.add_function("f");
        table.add_function_address_ranges(f, &[range(0x100, 0x200), range(0x300, 0x400)]);

        assert_eq!(functions_at(&table, 0x150), vec![f]);
        assert_eq!(functions_at(&table, 0x250), Vec::<UniqueId>::new());
        assert_eq!(functions_at(&table, 0x3FF), vec![f]);
        assert_eq!(functions_at(&table, 0x400), Vec::<UniqueId>::new());
        assert_eq!(functions_at(&table, 0xFF), Vec::<UniqueId>::new());
    }

    #[test]
    fn test_lookup_finds_every_overlapping_entity() {
        let mut table = empty_table();
        let outer = table.add_function("outer");
        let inlined = table.add_function("inlined");
        table.add_function_address_ranges(outer, &[range(0x1000, 0x2000)]);
        table.add_function_address_ranges(inlined, &[range(0x1800, 0x1900)]);

        assert_eq!(functions_at(&table, 0x1850), vec![outer, inlined]);
        assert_eq!(functions_at(&table, 0x1000), vec![outer]);
    }

    #[test]
    fn test_added_ranges_accumulate() {
        let mut table = empty_table();
        let f = table.add_function("f");
        table.add_function_address_ranges(f, &[range(0x100, 0x110)]);
        table.add_function_address_ranges(f, &[range(0x104, 0x108)]);
        table.add_function_address_ranges(f, &[range(0x200, 0x210)]);

        assert_eq!(
            table.function_address_ranges(f),
            BTreeSet::from([range(0x100, 0x110), range(0x200, 0x210)])
        );
    }

    #[test]
    fn test_adjacent_input_ranges_coalesce() {
        let mut table = empty_table();
        let f = table.add_function("f");
        table.add_function_address_ranges(f, &[range(0x120, 0x130), range(0x100, 0x120)]);

        assert_eq!(
            table.function_address_ranges(f),
            BTreeSet::from([range(0x100, 0x130)])
        );
    }

    #[test]
    fn test_statement_accessors_and_lookup() {
        let mut table = empty_table();
        let s = table.add_statement(Path::new("/src/main.c"), 42, 7);
        table.add_statement_address_ranges(s, &[range(0x500, 0x508)]);

        assert_eq!(table.statement_path(s), Path::new("/src/main.c"));
        assert_eq!(table.statement_line(s), 42);
        assert_eq!(table.statement_column(s), 7);

        let mut visited = Vec::new();
        table.visit_statements_at(Address::new(0x504), |uid| {
            visited.push(uid);
            true
        });
        assert_eq!(visited, vec![s]);
    }

    #[test]
    fn test_visitor_early_termination() {
        let mut table = empty_table();
        for name in ["a", "b", "c", "d"] {
            table.add_function(name);
        }
        let mut visited = 0;
        table.visit_functions(|_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_visit_by_name_and_source_file() {
        let mut table = empty_table();
        let f0 = table.add_function("dup");
        let _g = table.add_function("other");
        let f1 = table.add_function("dup");
        let s0 = table.add_statement(Path::new("/src/a.c"), 1, 0);
        let _s1 = table.add_statement(Path::new("/src/b.c"), 2, 0);
        let s2 = table.add_statement(Path::new("/src/a.c"), 3, 0);

        let mut by_name = Vec::new();
        table.visit_functions_by_name("dup", |uid| {
            by_name.push(uid);
            true
        });
        assert_eq!(by_name, vec![f0, f1]);

        let mut by_file = Vec::new();
        table.visit_statements_by_source_file(Path::new("/src/a.c"), |uid| {
            by_file.push(uid);
            true
        });
        assert_eq!(by_file, vec![s0, s2]);
    }

    #[test]
    fn test_function_statement_traversal() {
        let mut table = empty_table();
        let f = table.add_function("f");
        table.add_function_address_ranges(f, &[range(0x100, 0x140)]);
        let s_inside = table.add_statement(Path::new("/src/f.c"), 10, 0);
        table.add_statement_address_ranges(s_inside, &[range(0x110, 0x118)]);
        let s_entry = table.add_statement(Path::new("/src/f.c"), 9, 0);
        table.add_statement_address_ranges(s_entry, &[range(0x0F8, 0x104)]);
        let s_outside = table.add_statement(Path::new("/src/g.c"), 50, 0);
        table.add_statement_address_ranges(s_outside, &[range(0x200, 0x208)]);

        let mut statements = Vec::new();
        table.visit_function_statements(f, |uid| {
            statements.push(uid);
            true
        });
        assert_eq!(statements, vec![s_inside, s_entry]);

        let mut definitions = Vec::new();
        table.visit_function_definitions(f, |uid| {
            definitions.push(uid);
            true
        });
        assert_eq!(definitions, vec![s_entry]);

        let mut functions = Vec::new();
        table.visit_statement_functions(s_inside, |uid| {
            functions.push(uid);
            true
        });
        assert_eq!(functions, vec![f]);

        let mut none = Vec::new();
        table.visit_statement_functions(s_outside, |uid| {
            none.push(uid);
            true
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_clone_assigns_fresh_identifier() {
        let mut source = empty_table();
        let f = source.add_function("f");
        source.add_function_address_ranges(f, &[range(0x100, 0x110)]);
        let s = source.add_statement(Path::new("/src/f.c"), 3, 1);
        source.add_statement_address_ranges(s, &[range(0x104, 0x108)]);

        let mut destination = empty_table();
        destination.add_function("already-there");
        let cloned_f = destination.clone_function(&source, f);
        let cloned_s = destination.clone_statement(&source, s);

        assert_eq!(cloned_f, 1);
        assert_eq!(cloned_s, 0);
        assert_eq!(destination.function_mangled_name(cloned_f), "f");
        assert_eq!(
            destination.function_address_ranges(cloned_f),
            source.function_address_ranges(f)
        );
        assert_eq!(destination.statement_line(cloned_s), 3);
        assert_eq!(functions_at(&destination, 0x105), vec![cloned_f]);
    }

    #[test]
    fn test_message_round_trip() {
        let mut table = empty_table();
        let f = table.add_function("_Z1fv");
        table.add_function_address_ranges(f, &[range(0x100, 0x200), range(0x300, 0x400)]);
        let g = table.add_function("_Z1gv");
        table.add_function_address_ranges(g, &[range(0x500, 0x540)]);
        let s = table.add_statement(Path::new("/src/f.cpp"), 12, 4);
        table.add_statement_address_ranges(s, &[range(0x100, 0x108)]);

        let mut restored = SymbolTable::from_message(&table.to_message());

        assert_eq!(restored.path(), table.path());
        assert_eq!(restored.checksum(), table.checksum());
        assert_eq!(restored.function_mangled_name(f), "_Z1fv");
        assert_eq!(restored.function_mangled_name(g), "_Z1gv");
        assert_eq!(
            restored.function_address_ranges(f),
            table.function_address_ranges(f)
        );
        assert_eq!(restored.statement_path(s), Path::new("/src/f.cpp"));
        assert_eq!(restored.statement_line(s), 12);
        assert_eq!(restored.statement_column(s), 4);
        assert_eq!(
            restored.statement_address_ranges(s),
            table.statement_address_ranges(s)
        );
        assert_eq!(functions_at(&restored, 0x350), vec![f]);
        assert_eq!(restored.add_function("next"), 2);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let dir = std::env::temp_dir();
        let path_a = dir.join("stackpulse-symtab-checksum-a");
        let path_b = dir.join("stackpulse-symtab-checksum-b");
        fs::File::create(&path_a)
            .unwrap()
            .write_all(b"\x7fELF contents")
            .unwrap();
        fs::File::create(&path_b)
            .unwrap()
            .write_all(b"\x7fELF different")
            .unwrap();

        let first = SymbolTable::new(&path_a).unwrap();
        let second = SymbolTable::new(&path_a).unwrap();
        let other = SymbolTable::new(&path_b).unwrap();

        assert_eq!(first.checksum(), second.checksum());
        assert_ne!(first.checksum(), other.checksum());

        fs::remove_file(&path_a).ok();
        fs::remove_file(&path_b).ok();
    }

    #[test]
    #[should_panic(expected = "unknown function identifier")]
    fn test_out_of_range_identifier_asserts() {
        let table = empty_table();
        table.function_mangled_name(0);
    }
}
