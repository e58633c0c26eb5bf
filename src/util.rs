pub mod buf_ext;
pub mod legacy_id;
