pub mod cfapis;
