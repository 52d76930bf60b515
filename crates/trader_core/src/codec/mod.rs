//! Wire codec: record classification, session cipher and fill notices.

pub mod cipher;
pub mod fill;
pub mod frame;

pub use cipher::{CipherMaterial, SessionCipherContext};
pub use fill::{FillKind, FillNotice};
pub use frame::{
    ControlMessage, EncryptedFillNotice, FILL_NOTICE_TR_IDS, Frame, FrameDecoder,
    HEARTBEAT_TR_ID, MarketEvent, QUOTE_TR_ID, QuoteUpdate, TRADE_TR_ID, TradeTick, VI_TR_ID,
    ViDirection, VolatilityEvent, is_fill_notice_tr_id,
};
