use crate::object::impl_any;
use crate::{DataCell, HeapObject, ObjectKind, Visitor};

/// Rest arguments of an activation, materialised as a value.
#[derive(Debug)]
pub struct RestObject {
    args: Vec<DataCell>,
}

impl RestObject {
    pub fn new(args: Vec<DataCell>) -> Self {
        Self { args }
    }

    pub fn args(&self) -> &[DataCell] {
        &self.args
    }
}

impl HeapObject for RestObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Rest
    }

    fn describe(&self) -> String {
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        format!("Rest[{}]", args.join(", "))
    }

    fn set_members_reachable(&self, visitor: &mut dyn Visitor) {
        visitor.visit_all(&self.args);
    }

    impl_any!();
}
