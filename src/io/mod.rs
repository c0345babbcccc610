mod block_cache;
mod buffered_reader;
mod file_reader;
mod range_reader;
mod s3_reader;
mod tee;

pub use block_cache::{BlockCache, DEFAULT_BLOCK_CAPACITY, DEFAULT_BLOCK_SIZE};
pub use buffered_reader::BufferedRangeReader;
pub use file_reader::FileRangeReader;
pub use range_reader::{read_all, read_head, RangeReader};
pub(crate) use s3_reader::sdk_status;
pub use s3_reader::{create_s3_client, S3RangeReader};
pub use tee::{TeeSide, TeeWriter};
