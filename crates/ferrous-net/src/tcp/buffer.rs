/// Fixed-capacity byte FIFO used as a connection's receive buffer.
///
/// `head` is the next byte to read, `tail` the next slot to write, `count`
/// the number of buffered bytes. Storage is allocated once.
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.count
    }

    /// Append as much of `bytes` as fits. Returns the number written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        let cap = self.capacity();
        let first = n.min(cap - self.tail);
        self.data[self.tail..self.tail + first].copy_from_slice(&bytes[..first]);
        self.data[..n - first].copy_from_slice(&bytes[first..n]);
        self.tail = (self.tail + n) % cap;
        self.count += n;
        n
    }

    /// Move up to `out.len()` bytes out of the buffer.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count);
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.data[..n - first]);
        self.head = (self.head + n) % cap;
        self.count -= n;
        n
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}
