//! Ordered wave lists, kept as contiguous `Vec`s with stable insertion
//! rather than the original's singly-linked list — no structural sharing
//! is ever needed once the file has been loaded.

use crate::entry::InittabEntry;

/// Inserts `entry` into `list`, which must already be sorted ascending by
/// [`InittabEntry::order_key`]. Ties are broken by insertion order: an
/// entry is placed after every existing entry with the same order.
pub fn insert_stable(list: &mut Vec<InittabEntry>, entry: InittabEntry) {
    let key = entry.order_key();
    let pos = list
        .iter()
        .position(|e| e.order_key() > key)
        .unwrap_or(list.len());
    list.insert(pos, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryType;

    fn entry(order: u32) -> InittabEntry {
        InittabEntry {
            order: Some(order),
            core_id: None,
            entry_type: EntryType::Service,
            ctty_path: String::new(),
            process_name: format!("/bin/p{order}"),
        }
    }

    #[test]
    fn maintains_ascending_order() {
        let mut list = Vec::new();
        insert_stable(&mut list, entry(3));
        insert_stable(&mut list, entry(1));
        insert_stable(&mut list, entry(2));
        let orders: Vec<u32> = list.iter().map(|e| e.order_key()).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn ties_are_appended_after_existing_entries() {
        let mut list = Vec::new();
        let mut first = entry(1);
        first.process_name = "/bin/first".into();
        let mut second = entry(1);
        second.process_name = "/bin/second".into();
        insert_stable(&mut list, first);
        insert_stable(&mut list, second);
        let names: Vec<&str> = list.iter().map(|e| e.process_name.as_str()).collect();
        assert_eq!(names, vec!["/bin/first", "/bin/second"]);
    }

    #[test]
    fn tie_inserted_between_lower_and_higher_orders() {
        let mut list = Vec::new();
        insert_stable(&mut list, entry(1));
        insert_stable(&mut list, entry(3));
        insert_stable(&mut list, entry(2));
        let orders: Vec<u32> = list.iter().map(|e| e.order_key()).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }
}
