pub mod fast_loop;
