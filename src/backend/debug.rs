//! Handle tracking for the debug context.
//!
//! Every handle a debug-origin upcall returns is recorded with its
//! generation. A record is a leak while the slot is still live with the
//! same generation; once the slot is released (or reused) the record is
//! stale and dropped on the next prune.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::runtime::handles::HandleTable;

#[derive(Debug, Clone, Copy)]
struct Record {
    id: u32,
    generation: u32,
    origin: &'static str,
}

/// A handle opened through the debug context and not closed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugLeak {
    pub handle: u32,
    /// Context function that produced the handle.
    pub origin: &'static str,
}

#[derive(Debug, Default)]
pub struct DebugHandles {
    records: Vec<Record>,
    /// Handles closed by trampoline scopes, per native function.
    swept: BTreeMap<String, usize>,
}

impl DebugHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: u32, generation: u32, origin: &'static str) {
        self.records.push(Record {
            id,
            generation,
            origin,
        });
    }

    pub fn add_swept(&mut self, function: &str, count: usize) {
        *self.swept.entry(function.to_string()).or_insert(0) += count;
    }

    pub fn swept(&self) -> &BTreeMap<String, usize> {
        &self.swept
    }

    pub fn swept_total(&self) -> usize {
        self.swept.values().sum()
    }

    /// Drops records whose handle has been closed since.
    pub fn prune(&mut self, table: &HandleTable) {
        self.records.retain(|r| is_open(table, r));
    }

    pub fn leaks(&self, table: &HandleTable) -> Vec<DebugLeak> {
        self.records
            .iter()
            .filter(|r| is_open(table, r))
            .map(|r| DebugLeak {
                handle: r.id,
                origin: r.origin,
            })
            .collect()
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }
}

fn is_open(table: &HandleTable, record: &Record) -> bool {
    table.is_live(record.id) && table.generation(record.id) == Some(record.generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn test_open_record_is_a_leak() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let mut debug = DebugHandles::new();
        let id = table.alloc(vm.new_int(1));
        debug.record(id, table.generation(id).unwrap(), "ctx_Long_FromLong");
        assert_eq!(
            debug.leaks(&table),
            vec![DebugLeak {
                handle: id,
                origin: "ctx_Long_FromLong"
            }]
        );
        table.release(id);
        assert!(debug.leaks(&table).is_empty());
    }

    #[test]
    fn test_reused_slot_is_not_a_leak() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let mut debug = DebugHandles::new();
        let id = table.alloc(vm.new_int(1));
        debug.record(id, table.generation(id).unwrap(), "ctx_Dup");
        table.release(id);
        let again = table.alloc(vm.new_int(2));
        assert_eq!(again, id);
        assert!(debug.leaks(&table).is_empty());
        debug.prune(&table);
        assert_eq!(debug.tracked(), 0);
    }

    #[test]
    fn test_swept_counts() {
        let mut debug = DebugHandles::new();
        debug.add_swept("f", 2);
        debug.add_swept("g", 1);
        debug.add_swept("f", 1);
        assert_eq!(debug.swept().get("f"), Some(&3));
        assert_eq!(debug.swept_total(), 4);
    }
}
