use std::fmt;
use std::ops::Deref;

pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

impl Input for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}

/// A buffer lent by the driving loop for exactly one invocation.
///
/// The loop is free to overwrite or release the storage as soon as the
/// invocation returns, so anything that outlives the call has to go through
/// [`FuzzInput::to_owned_data`].
#[derive(Clone, Copy)]
pub struct FuzzInput<'a> {
    bytes: &'a [u8],
}

impl<'a> FuzzInput<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Defensive copy handed to the fuzz target.
    pub fn to_owned_data(&self) -> FuzzData {
        FuzzData {
            bytes: self.bytes.to_vec(),
        }
    }
}

impl fmt::Debug for FuzzInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuzzInput")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// The owned copy of one iteration's input, as seen by the fuzz target.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct FuzzData {
    bytes: Vec<u8>,
}

impl FuzzData {
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for FuzzData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for FuzzData {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for FuzzData {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for FuzzData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuzzData({} bytes)", self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_u8_impl_input() {
        let data: Vec<u8> = vec![1, 2, 3];
        let empty_data: Vec<u8> = vec![];
        assert_eq!(data.as_bytes(), &[1, 2, 3]);
        assert_eq!(Input::len(&data), 3);
        assert!(!Input::is_empty(&data));
        assert!(Input::is_empty(&empty_data));
    }

    #[test]
    fn owned_copy_survives_reuse_of_the_source_buffer() {
        let mut scratch = vec![0x41u8, 0x42, 0x43];
        let copy = FuzzInput::new(&scratch).to_owned_data();
        scratch.iter_mut().for_each(|b| *b = 0);
        scratch.truncate(1);
        assert_eq!(&*copy, b"ABC");
        assert_eq!(copy.into_vec(), b"ABC".to_vec());
    }

    #[test]
    fn debug_output_does_not_dump_contents() {
        let data = FuzzData::from(vec![0xde, 0xad]);
        assert_eq!(format!("{data:?}"), "FuzzData(2 bytes)");
        let view = FuzzInput::new(&[1, 2, 3]);
        assert!(format!("{view:?}").contains("len: 3"));
    }
}
