#[allow(clippy::all, clippy::pedantic, warnings)]
pub mod celestial_capnp {
    include!(concat!(env!("OUT_DIR"), "/celestial_capnp.rs"));
}
