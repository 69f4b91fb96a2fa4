//! Change notification for the cluster's observable fields.
//!
//! Wrappers never call a handler themselves. A mutation returns the resulting
//! [`Change`] (or `None` when nothing changed) and the owning setter hands it to
//! its single state-transition handler before returning, so side effects of one
//! transition are complete before the next event is looked at.

/// A single mutation of a wrapped field.
///
/// Scalars report `prev`/`current` values directly. Sequences report
/// `Option<T>`: an addition has `prev: None`, a removal has `current: None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub property: &'static str,
    pub prev: T,
    pub current: T,
}

/// A scalar field that reports every change of value.
#[derive(Debug)]
pub struct Notifiable<T> {
    property: &'static str,
    value: T,
}

impl<T: PartialEq + Clone> Notifiable<T> {
    pub fn new(property: &'static str, value: T) -> Self {
        Self { property, value }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Assign `value`. Assigning the current value is a no-op.
    #[must_use = "the change must be dispatched to the owner's handler"]
    pub fn set(&mut self, value: T) -> Option<Change<T>> {
        if self.value == value {
            return None;
        }
        let prev = std::mem::replace(&mut self.value, value);
        Some(Change {
            property: self.property,
            prev,
            current: self.value.clone(),
        })
    }
}

/// An insertion-ordered sequence without duplicates.
#[derive(Debug)]
pub struct UniqueList<T> {
    property: &'static str,
    items: Vec<T>,
}

impl<T: PartialEq + Clone> UniqueList<T> {
    pub fn new(property: &'static str) -> Self {
        Self {
            property,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    /// Append `value` unless an equal element is already present.
    #[must_use = "the change must be dispatched to the owner's handler"]
    pub fn add(&mut self, value: T) -> Option<Change<Option<T>>> {
        if self.items.contains(&value) {
            return None;
        }
        self.items.push(value.clone());
        Some(Change {
            property: self.property,
            prev: None,
            current: Some(value),
        })
    }

    /// Remove the first element equal to `value`.
    #[must_use = "the change must be dispatched to the owner's handler"]
    pub fn remove(&mut self, value: &T) -> Option<Change<Option<T>>> {
        self.remove_where(|item| item == value)
    }

    /// Remove the first element matching `predicate`.
    #[must_use = "the change must be dispatched to the owner's handler"]
    pub fn remove_where<P>(&mut self, predicate: P) -> Option<Change<Option<T>>>
    where
        P: FnMut(&T) -> bool,
    {
        let idx = self.items.iter().position(predicate)?;
        let removed = self.items.remove(idx);
        Some(Change {
            property: self.property,
            prev: Some(removed),
            current: None,
        })
    }
}

impl<'a, T> IntoIterator for &'a UniqueList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_same_value_is_silent() {
        let mut term = Notifiable::new("term", 3i64);
        assert!(term.set(3).is_none());
        assert_eq!(*term.get(), 3);
    }

    #[test]
    fn test_set_reports_prev_and_current() {
        let mut term = Notifiable::new("term", 3i64);
        let change = term.set(4).expect("value changed");
        assert_eq!(
            change,
            Change {
                property: "term",
                prev: 3,
                current: 4
            }
        );
        assert_eq!(*term.get(), 4);
    }

    #[test]
    fn test_optional_scalar() {
        let mut leader: Notifiable<Option<u32>> = Notifiable::new("leader", None);
        let change = leader.set(Some(7)).expect("value changed");
        assert_eq!(change.prev, None);
        assert_eq!(change.current, Some(7));
        assert!(leader.set(Some(7)).is_none());
    }

    #[test]
    fn test_add_is_unique() {
        let mut nodes = UniqueList::new("nodes");
        let change = nodes.add("a").expect("added");
        assert_eq!(change.prev, None);
        assert_eq!(change.current, Some("a"));

        assert!(nodes.add("a").is_none());
        assert!(nodes.add("b").is_some());
        assert_eq!(nodes.iter().copied().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_where_takes_first_match() {
        let mut nodes = UniqueList::new("nodes");
        let _ = nodes.add(10);
        let _ = nodes.add(21);
        let _ = nodes.add(31);

        let change = nodes.remove_where(|n| n % 2 == 1).expect("removed");
        assert_eq!(change.prev, Some(21));
        assert_eq!(change.current, None);
        assert_eq!(nodes.len(), 2);
        assert!(!nodes.contains(&21));
    }

    #[test]
    fn test_remove_missing_is_silent() {
        let mut nodes: UniqueList<u8> = UniqueList::new("nodes");
        assert!(nodes.remove(&1).is_none());
        let _ = nodes.add(1);
        assert!(nodes.remove(&1).is_some());
        assert!(nodes.is_empty());
    }
}
