// 上传引擎模块

pub mod engine;
pub mod hash;
pub mod slice;

pub use engine::{
    from_tos, upload, upload_file, FromTo, ProgressFn, UploadOptions, UploadOutcome,
};
pub use hash::{calc_file_sha1, calc_pre_hash, calc_proof_code, calc_sha1, ONE_K};
pub use slice::{adjust_slice_size, SlicePlan, DEFAULT_SLICE_SIZE, MAX_PART_NUMBER};
