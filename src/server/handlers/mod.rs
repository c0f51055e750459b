pub mod offers;
pub mod rides;
