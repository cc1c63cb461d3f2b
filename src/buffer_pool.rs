use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// A pool of encode buffers shared by all frame-emitting paths of a listener or dialer,
///  so the steady-state hot path does not allocate per frame.
pub struct FrameBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl FrameBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> FrameBufferPool {
        FrameBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
