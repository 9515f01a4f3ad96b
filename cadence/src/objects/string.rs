use std::rc::Rc;

use crate::object::impl_any;
use crate::{HeapObject, ObjectKind, VirtualTable, Visitor};

use super::stable_hash;

/// Immutable UTF-8 text.
#[derive(Debug)]
pub struct StringObject {
    vtable: Option<Rc<VirtualTable>>,
    text: String,
}

impl StringObject {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            vtable: None,
            text: text.into(),
        }
    }

    pub fn with_vtable(mut self, vtable: Option<Rc<VirtualTable>>) -> Self {
        self.vtable = vtable;
        self
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in chars.
    pub fn length(&self) -> usize {
        self.text.chars().count()
    }

    pub fn char_at(&self, index: usize) -> Option<char> {
        self.text.chars().nth(index)
    }
}

impl HeapObject for StringObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::String
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn describe(&self) -> String {
        self.text.clone()
    }

    fn equals(&self, other: &dyn HeapObject) -> bool {
        other
            .downcast_ref::<StringObject>()
            .is_some_and(|o| o.text == self.text)
    }

    fn hash_value(&self) -> Option<u64> {
        Some(stable_hash(&self.text))
    }

    fn set_members_reachable(&self, _visitor: &mut dyn Visitor) {}

    impl_any!();
}

#[derive(Debug)]
pub struct UrlObject {
    vtable: Option<Rc<VirtualTable>>,
    url: String,
}

impl UrlObject {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            vtable: None,
            url: url.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl HeapObject for UrlObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Url
    }

    fn vtable(&self) -> Option<&Rc<VirtualTable>> {
        self.vtable.as_ref()
    }

    fn describe(&self) -> String {
        self.url.clone()
    }

    fn equals(&self, other: &dyn HeapObject) -> bool {
        other
            .downcast_ref::<UrlObject>()
            .is_some_and(|o| o.url == self.url)
    }

    fn hash_value(&self) -> Option<u64> {
        Some(stable_hash(&self.url))
    }

    fn set_members_reachable(&self, _visitor: &mut dyn Visitor) {}

    impl_any!();
}

#[derive(Debug)]
pub struct BytesObject {
    bytes: Vec<u8>,
}

impl BytesObject {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl HeapObject for BytesObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Bytes
    }

    fn describe(&self) -> String {
        format!("<Bytes len={}>", self.bytes.len())
    }

    fn equals(&self, other: &dyn HeapObject) -> bool {
        other
            .downcast_ref::<BytesObject>()
            .is_some_and(|o| o.bytes == self.bytes)
    }

    fn hash_value(&self) -> Option<u64> {
        Some(stable_hash(&self.bytes))
    }

    fn set_members_reachable(&self, _visitor: &mut dyn Visitor) {}

    impl_any!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chars_not_bytes() {
        let s = StringObject::new("héllo");
        assert_eq!(s.length(), 5);
        assert_eq!(s.char_at(1), Some('é'));
        assert_eq!(s.char_at(5), None);
    }

    #[test]
    fn equal_text_hashes_equal() {
        let a = StringObject::new("abc");
        let b = StringObject::new("abc");
        assert_eq!(a.hash_value(), b.hash_value());
        assert!(a.equals(&b));
        assert!(!a.equals(&UrlObject::new("abc")));
    }
}
