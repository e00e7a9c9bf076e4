pub mod token_ring;
