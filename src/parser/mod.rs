pub mod record_stream_parser;
pub mod trace_parser;
pub mod trace_record;
