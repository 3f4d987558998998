use tbm_gem::{Access, CacheFlags, DeviceClass, Flags};

fn main() {
    env_logger::init();

    let mgr = tbm_gem::Builder::new()
        .node_path("/dev/dri/card0")
        .build()
        .unwrap();
    println!(
        "dma fence {} backend flags {:?}",
        mgr.config().dma_fence,
        mgr.backend_flags()
    );

    let bo = tbm_gem::Bo::alloc(mgr.clone(), 1 << 20, Flags::SCANOUT).unwrap();
    let name = bo.export().unwrap();
    println!(
        "bo gem handle {} name {} size {} gem flags {:?}",
        bo.gem_handle(),
        name,
        bo.size(),
        bo.gem_flags()
    );

    let bo2 = tbm_gem::Bo::import(mgr.clone(), name).unwrap();
    println!(
        "imported gem handle {} refcount {}",
        bo2.gem_handle(),
        mgr.refcount(name)
    );

    let addr = bo.map(DeviceClass::Cpu, Access::ReadWrite).unwrap();
    println!("cpu addr 0x{:x}", addr.as_u64());

    if mgr.config().dma_fence {
        bo.lock(DeviceClass::Cpu, Access::Write).unwrap();
        bo.unlock().unwrap();
    } else {
        bo.cache_flush(CacheFlags::FLUSH).unwrap();
    }
    bo.unmap().unwrap();

    let dmabuf = bo2.handle(DeviceClass::G3d).unwrap();
    println!("dma-buf fd {}", dmabuf.as_u64());

    bo2.free();
    bo.free();
}
