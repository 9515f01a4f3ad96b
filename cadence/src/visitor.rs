use crate::DataCell;

/// Receives the cells held by a heap object or a root.
///
/// Visiting an object means visiting only its direct edges; following an
/// edge into another object is the caller's business.
pub trait Visitor {
    fn visit(&mut self, cell: &DataCell);

    fn visit_all(&mut self, cells: &[DataCell]) {
        for cell in cells {
            self.visit(cell);
        }
    }
}

impl<F: FnMut(&DataCell)> Visitor for F {
    fn visit(&mut self, cell: &DataCell) {
        self(cell)
    }
}

/// Anything that holds cells the reachability pass must start from.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn Visitor);
}
