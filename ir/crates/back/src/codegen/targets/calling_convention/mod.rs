pub mod systemv;
