use std::collections::HashMap;

use parking_lot::RwLock;

use crate::core::{
    StoreError,
    ticket::{TicketRecord, TicketRepository},
};

#[derive(Default)]
pub struct MemoryTicketRepository {
    records: RwLock<HashMap<String, TicketRecord>>,
}

impl MemoryTicketRepository {
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl TicketRepository for MemoryTicketRepository {
    fn find(&self, id: &str) -> Result<Option<TicketRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn save(&self, record: TicketRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    fn retain(&self, keep: &mut dyn FnMut(&TicketRecord) -> bool) -> Result<usize, StoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| keep(record));
        Ok(before - records.len())
    }
}
