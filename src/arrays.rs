// Islet Arrays - Vector, String and General Array Storage
//
// Flat row-major storage with a rank-flexible dimension vector. Strings
// are character-bodied rank-1 arrays; their class differs from general
// vectors only through the body kind.

use crate::types::NodeId;

/// Handle to an array (index into ArrayStore)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayBody {
    General(Vec<NodeId>),
    Chars(Vec<char>),
}

#[derive(Debug, Clone)]
pub struct ArrayObject {
    pub dimensions: Vec<usize>,
    pub body: ArrayBody,
}

impl ArrayObject {
    pub fn total_size(&self) -> usize {
        if self.dimensions.is_empty() {
            1
        } else {
            self.dimensions.iter().product()
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_string(&self) -> bool {
        matches!(self.body, ArrayBody::Chars(_))
    }

    pub fn is_vector(&self) -> bool {
        self.rank() == 1
    }

    pub fn len(&self) -> usize {
        match &self.body {
            ArrayBody::General(v) => v.len(),
            ArrayBody::Chars(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major position of a multi-dimensional subscript list.
    pub fn row_major_index(&self, subscripts: &[usize]) -> Option<usize> {
        if subscripts.len() != self.rank() {
            return None;
        }
        let mut index = 0;
        for (i, &sub) in subscripts.iter().enumerate() {
            if sub >= self.dimensions[i] {
                return None;
            }
            index = index * self.dimensions[i] + sub;
        }
        Some(index)
    }

    pub fn as_string(&self) -> Option<String> {
        match &self.body {
            ArrayBody::Chars(v) => Some(v.iter().collect()),
            ArrayBody::General(_) => None,
        }
    }
}

/// Storage for arrays, strings and vectors
pub struct ArrayStore {
    arrays: Vec<ArrayObject>,
}

impl ArrayStore {
    pub fn new() -> Self {
        Self { arrays: Vec::new() }
    }

    fn push(&mut self, obj: ArrayObject) -> VectorId {
        let idx = self.arrays.len() as u32;
        self.arrays.push(obj);
        VectorId(idx)
    }

    /// Allocate a general vector with given size and initial element
    pub fn alloc_vector(&mut self, size: usize, initial_element: NodeId) -> VectorId {
        self.push(ArrayObject {
            dimensions: vec![size],
            body: ArrayBody::General(vec![initial_element; size]),
        })
    }

    /// Allocate a general vector from existing content
    pub fn alloc_from_vec(&mut self, content: Vec<NodeId>) -> VectorId {
        self.push(ArrayObject {
            dimensions: vec![content.len()],
            body: ArrayBody::General(content),
        })
    }

    /// Allocate a string
    pub fn alloc_string(&mut self, content: &str) -> VectorId {
        let chars: Vec<char> = content.chars().collect();
        self.push(ArrayObject {
            dimensions: vec![chars.len()],
            body: ArrayBody::Chars(chars),
        })
    }

    /// Allocate a general array with arbitrary rank
    pub fn alloc_array(&mut self, dimensions: Vec<usize>, initial_element: NodeId) -> VectorId {
        let total = if dimensions.is_empty() {
            1
        } else {
            dimensions.iter().product()
        };
        self.push(ArrayObject {
            dimensions,
            body: ArrayBody::General(vec![initial_element; total]),
        })
    }

    pub fn get(&self, id: VectorId) -> Option<&ArrayObject> {
        self.arrays.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: VectorId) -> Option<&mut ArrayObject> {
        self.arrays.get_mut(id.0 as usize)
    }

    /// Element at row-major index; char elements must go through the
    /// machine, which turns them into character values.
    pub fn aref_general(&self, id: VectorId, index: usize) -> Option<NodeId> {
        match self.arrays.get(id.0 as usize)?.body {
            ArrayBody::General(ref v) => v.get(index).copied(),
            ArrayBody::Chars(_) => None,
        }
    }

    pub fn aref_char(&self, id: VectorId, index: usize) -> Option<char> {
        match self.arrays.get(id.0 as usize)?.body {
            ArrayBody::Chars(ref v) => v.get(index).copied(),
            ArrayBody::General(_) => None,
        }
    }

    pub fn set_general(&mut self, id: VectorId, index: usize, value: NodeId) -> bool {
        if let Some(ArrayObject {
            body: ArrayBody::General(v),
            ..
        }) = self.arrays.get_mut(id.0 as usize)
        {
            if index < v.len() {
                v[index] = value;
                return true;
            }
        }
        false
    }

    pub fn set_char(&mut self, id: VectorId, index: usize, value: char) -> bool {
        if let Some(ArrayObject {
            body: ArrayBody::Chars(v),
            ..
        }) = self.arrays.get_mut(id.0 as usize)
        {
            if index < v.len() {
                v[index] = value;
                return true;
            }
        }
        false
    }

    pub fn length(&self, id: VectorId) -> Option<usize> {
        self.arrays.get(id.0 as usize).map(|a| a.len())
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

impl Default for ArrayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_roundtrip() {
        let mut store = ArrayStore::new();
        let id = store.alloc_vector(3, NodeId(0));
        assert_eq!(store.length(id), Some(3));
        assert!(store.set_general(id, 1, NodeId(42)));
        assert_eq!(store.aref_general(id, 1), Some(NodeId(42)));
        assert!(!store.set_general(id, 3, NodeId(42)));
    }

    #[test]
    fn test_string_storage() {
        let mut store = ArrayStore::new();
        let id = store.alloc_string("abc");
        assert_eq!(store.length(id), Some(3));
        assert_eq!(store.aref_char(id, 2), Some('c'));
        assert!(store.set_char(id, 0, 'x'));
        assert_eq!(store.get(id).unwrap().as_string(), Some("xbc".to_string()));
    }

    #[test]
    fn test_row_major_indexing() {
        let mut store = ArrayStore::new();
        let id = store.alloc_array(vec![2, 3], NodeId(0));
        let arr = store.get(id).unwrap();
        assert_eq!(arr.row_major_index(&[0, 0]), Some(0));
        assert_eq!(arr.row_major_index(&[1, 2]), Some(5));
        assert_eq!(arr.row_major_index(&[2, 0]), None);
        assert_eq!(arr.row_major_index(&[0]), None);
    }

    #[test]
    fn test_arbitrary_rank() {
        let mut store = ArrayStore::new();
        let id = store.alloc_array(vec![2, 2, 2, 2], NodeId(0));
        assert_eq!(store.get(id).unwrap().rank(), 4);
        assert_eq!(store.get(id).unwrap().total_size(), 16);
    }
}
