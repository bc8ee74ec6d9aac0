use super::Backend;

/// Input file backed by an owned buffer
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create a new memory backend that takes ownership of `data`
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory() {
        let mut data = vec![0xCC_u8; 64];
        data[10] = 0x68;
        data[15] = 0xE8;

        let memory = Memory::new(data);

        assert_eq!(memory.len(), 64);
        assert_eq!(memory.data()[0], 0xCC);
        assert_eq!(memory.data_slice(10, 6).unwrap()[5], 0xE8);

        assert!(memory.data_slice(usize::MAX, 1).is_err());
        assert!(memory.data_slice(0, 65).is_err());
    }

    #[test]
    fn memory_empty_buffer() {
        let memory = Memory::new(vec![]);

        assert_eq!(memory.len(), 0);
        assert!(memory.data_slice(0, 1).is_err());
        assert!(memory.data_slice(0, 0).unwrap().is_empty());
    }
}
