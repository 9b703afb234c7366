// Transport adapters: BLE (GATT frames) and QR (text pages)

pub mod ble;
pub mod qr;

pub use qr::{
    build_qr_pages, decode_page, encode_page, parse_qr_pages, QrError, QrScanCollector,
    QrScanProgress, QR_TAG, QR_VERSION,
};
