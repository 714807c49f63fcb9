mod postgres;
mod print;

pub use postgres::PgUserSink;
pub use print::PrintSink;
