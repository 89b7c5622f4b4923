use multipass_backend::renderer::device::{
    AttachmentPoint, ClearPlanes, FramebufferStatus, GpuDevice, PixelRect, RenderTarget,
};
use multipass_backend::renderer::framebuffer::{ShadowViewport, MAX_SHADOW_MIP};
use multipass_backend::renderer::recording::READBACK_FILL;
use multipass_backend::renderer::surface::ScreenRect;
use multipass_backend::renderer::{
    Binding, Capabilities, CaptureRequest, FramebufferStateMachine, GpuCommand, RecordingDevice,
    RenderError, TargetState,
};
use multipass_backend::settings::{RenderSettings, ShadowTechnique};

const NVIDIA: u32 = 0x10DE;

fn setup(width: u32, height: u32) -> (FramebufferStateMachine, RecordingDevice) {
    let caps = Capabilities::from_pci_id(NVIDIA);
    (
        FramebufferStateMachine::new(&caps, width, height),
        RecordingDevice::new(),
    )
}

fn shadow_viewport(light: ScreenRect) -> ShadowViewport {
    ShadowViewport {
        light_scissor: light,
        view_viewport: ScreenRect::full(1920, 1080),
        current_scissor: ScreenRect::full(1920, 1080),
    }
}

fn extents(device: &RecordingDevice, target: RenderTarget) -> Vec<(u32, u32)> {
    device
        .allocations(target)
        .iter()
        .map(|desc| (desc.width, desc.height))
        .collect()
}

#[test]
fn resolution_scale_reallocates_only_on_change() {
    let (mut fsm, mut device) = setup(1920, 1080);
    let mut settings = RenderSettings {
        fbo_resolution: 0.5,
        ..RenderSettings::default()
    };

    fsm.enter_primary(&mut device, &mut settings);
    assert_eq!(fsm.state(), TargetState::Primary);
    for target in [
        RenderTarget::CurrentRender,
        RenderTarget::PrimaryColor,
        RenderTarget::CurrentDepth,
    ] {
        assert_eq!(extents(&device, target), vec![(960, 540)], "{:?}", target);
    }

    // Same scale: nothing is reallocated.
    fsm.leave_primary(&mut device, &settings);
    fsm.enter_primary(&mut device, &mut settings);
    assert_eq!(fsm.registry().allocation_count(), 3);

    settings.fbo_resolution = 1.0;
    fsm.leave_primary(&mut device, &settings);
    fsm.enter_primary(&mut device, &mut settings);
    for target in [
        RenderTarget::CurrentRender,
        RenderTarget::PrimaryColor,
        RenderTarget::CurrentDepth,
    ] {
        assert_eq!(
            extents(&device, target),
            vec![(960, 540), (1920, 1080)],
            "{:?}",
            target
        );
    }
    assert_eq!(device.live_framebuffers(), 1);
}

#[test]
fn entering_primary_twice_binds_and_clears_once() {
    let (mut fsm, mut device) = setup(640, 480);
    let mut settings = RenderSettings::default();

    fsm.enter_primary(&mut device, &mut settings);
    fsm.enter_primary(&mut device, &mut settings);

    assert_eq!(
        device.count(|c| matches!(c, GpuCommand::BindFramebuffer(Some(_)))),
        1
    );
    assert_eq!(
        device.count(|c| matches!(c, GpuCommand::Clear(p) if *p == ClearPlanes::COLOR)),
        1
    );
    assert_eq!(fsm.binding(), Binding::Primary);
}

#[test]
fn shared_colour_toggle_rebuilds_the_primary_binding() {
    let (mut fsm, mut device) = setup(640, 480);
    let mut settings = RenderSettings::default();

    fsm.enter_primary(&mut device, &mut settings);
    fsm.leave_primary(&mut device, &settings);
    settings.fbo_shared_color = true;
    fsm.enter_primary(&mut device, &mut settings);

    let primary = device.bound_framebuffer().expect("primary bound");
    let attachments = device.attachments(primary).expect("attachments");
    assert_eq!(
        attachments.color.map(|a| a.target),
        Some(RenderTarget::CurrentRender)
    );
    // The framebuffer object is reused, only re-attached.
    assert_eq!(device.count(|c| matches!(c, GpuCommand::CreateFramebuffer(_))), 1);

    // Sharing colour means post-processing already has the image.
    assert!(!fsm.copy_color_buffer(&mut device, &settings, &ScreenRect::full(640, 480)));
}

#[test]
fn disabled_offscreen_rendering_stays_on_the_default_target() {
    let (mut fsm, mut device) = setup(640, 480);
    let mut settings = RenderSettings {
        use_fbo: false,
        ..RenderSettings::default()
    };
    fsm.enter_primary(&mut device, &mut settings);
    assert_eq!(fsm.state(), TargetState::Default);
    assert!(device.commands().is_empty());

    fsm.leave_primary(&mut device, &settings);
    assert_eq!(device.count(|c| matches!(c, GpuCommand::PresentFullscreen(_))), 0);
}

#[test]
fn incomplete_primary_disables_offscreen_rendering() {
    let (mut fsm, mut device) = setup(640, 480);
    device.force_framebuffer_status(Some(FramebufferStatus::IncompleteAttachment));
    let mut settings = RenderSettings {
        soft_shadows_quality: 2,
        ..RenderSettings::default()
    };

    fsm.enter_primary(&mut device, &mut settings);

    assert!(!settings.use_fbo);
    assert_eq!(settings.soft_shadows_quality, 0);
    assert_eq!(fsm.state(), TargetState::Default);
    assert_eq!(device.live_framebuffers(), 0);
}

#[test]
fn unsupported_shadow_cube_falls_back_to_stencil_shadows() {
    let (mut fsm, mut device) = setup(1920, 1080);
    device.fail_framebuffers_using(Some(RenderTarget::ShadowCube));
    let mut settings = RenderSettings {
        shadows: ShadowTechnique::Maps,
        soft_shadows_quality: 3,
        ..RenderSettings::default()
    };
    fsm.enter_primary(&mut device, &mut settings);

    fsm.toggle_shadow(
        &mut device,
        &mut settings,
        true,
        true,
        &shadow_viewport(ScreenRect::new(0, 0, 99, 99)),
    );

    assert_eq!(settings.shadows, ShadowTechnique::Stencil);
    assert_eq!(settings.soft_shadows_quality, 0);
    assert_ne!(fsm.binding(), Binding::Shadow);
    // The primary target survives a shadow failure.
    assert!(settings.use_fbo);
}

#[test]
fn depth_is_copied_once_per_view() {
    let (mut fsm, mut device) = setup(1920, 1080);
    let mut settings = RenderSettings::default();
    let viewport = shadow_viewport(ScreenRect::new(100, 100, 400, 400));
    let copies = |device: &RecordingDevice| {
        device.count(|c| {
            matches!(
                c,
                GpuCommand::CopyToTexture {
                    target: RenderTarget::ShadowDepth,
                    ..
                }
            )
        })
    };

    fsm.enter_primary(&mut device, &mut settings);
    for _ in 0..3 {
        fsm.toggle_shadow(&mut device, &mut settings, true, false, &viewport);
        assert_eq!(fsm.binding(), Binding::Shadow);
        fsm.toggle_shadow(&mut device, &mut settings, false, false, &viewport);
        assert_eq!(fsm.binding(), Binding::Primary);
    }
    assert_eq!(copies(&device), 1);
    assert!(fsm.depth_copied_this_view());

    // Next view: entering again resets the one-shot flag.
    fsm.enter_primary(&mut device, &mut settings);
    fsm.toggle_shadow(&mut device, &mut settings, true, false, &viewport);
    assert_eq!(copies(&device), 2);
}

#[test]
fn separate_layout_never_copies_depth() {
    let caps = Capabilities::from_pci_id(0x8086);
    let mut fsm = FramebufferStateMachine::new(&caps, 800, 600);
    let mut device = RecordingDevice::new();
    let mut settings = RenderSettings::default();

    fsm.enter_primary(&mut device, &mut settings);
    fsm.toggle_shadow(
        &mut device,
        &mut settings,
        true,
        false,
        &shadow_viewport(ScreenRect::full(800, 600)),
    );
    assert_eq!(device.count(|c| matches!(c, GpuCommand::CopyToTexture { .. })), 0);
    assert_eq!(fsm.binding(), Binding::Shadow);
}

#[test]
fn light_of_64_pixels_on_a_1080_line_display_uses_mip_5() {
    let (mut fsm, mut device) = setup(1920, 1080);
    let mut settings = RenderSettings {
        shadows: ShadowTechnique::Maps,
        shadow_map_size: 1024,
        ..RenderSettings::default()
    };
    fsm.enter_primary(&mut device, &mut settings);

    fsm.toggle_shadow(
        &mut device,
        &mut settings,
        true,
        true,
        &shadow_viewport(ScreenRect::new(100, 200, 163, 263)),
    );
    assert_eq!(fsm.shadow_mip(), 5);
    assert!(device
        .commands()
        .contains(&GpuCommand::SetViewport(PixelRect::sized(32, 32))));
}

#[test]
fn small_lights_render_into_the_capped_cube_mip() {
    let (mut fsm, mut device) = setup(1920, 1080);
    let mut settings = RenderSettings {
        shadows: ShadowTechnique::Maps,
        shadow_map_size: 1024,
        ..RenderSettings::default()
    };
    fsm.enter_primary(&mut device, &mut settings);

    // A 10 pixel light would need more halvings than allowed.
    fsm.toggle_shadow(
        &mut device,
        &mut settings,
        true,
        true,
        &shadow_viewport(ScreenRect::new(0, 0, 9, 9)),
    );
    assert_eq!(fsm.shadow_mip(), MAX_SHADOW_MIP);

    let map = 1024 >> MAX_SHADOW_MIP;
    let attached_level = device.commands().iter().rev().find_map(|c| match c {
        GpuCommand::Attach {
            point: AttachmentPoint::Depth,
            attachment: Some(attachment),
            ..
        } => Some(attachment.level),
        _ => None,
    });
    assert_eq!(attached_level, Some(MAX_SHADOW_MIP));
    assert!(device
        .commands()
        .contains(&GpuCommand::SetViewport(PixelRect::sized(map, map))));
    assert!(device
        .commands()
        .contains(&GpuCommand::Clear(ClearPlanes::DEPTH)));

    // Leaving restores the view's viewport.
    fsm.toggle_shadow(
        &mut device,
        &mut settings,
        false,
        false,
        &shadow_viewport(ScreenRect::new(0, 0, 9, 9)),
    );
    assert_eq!(
        device.commands().iter().rev().find_map(|c| match c {
            GpuCommand::SetViewport(rect) => Some(*rect),
            _ => None,
        }),
        Some(PixelRect::sized(1920, 1080))
    );
}

#[test]
fn pack_buffer_capture_lags_one_frame() {
    let (mut fsm, mut device) = setup(64, 64);
    let settings = RenderSettings::default();
    let request = CaptureRequest {
        rect: PixelRect::sized(4, 4),
        use_pack_buffer: true,
    };
    let mut out = vec![1u8; 4 * 4 * 3];

    fsm.capture(&mut device, &settings, &request, &mut out)
        .expect("first capture");
    // Nothing had been read yet.
    assert!(out.iter().all(|&b| b == 0));

    fsm.capture(&mut device, &settings, &request, &mut out)
        .expect("second capture");
    assert!(out.iter().all(|&b| b == READBACK_FILL));
    assert_eq!(
        device.count(|c| matches!(c, GpuCommand::CreateBuffer { .. })),
        1
    );
}

#[test]
fn pack_buffer_size_change_is_rejected() {
    let (mut fsm, mut device) = setup(64, 64);
    let settings = RenderSettings::default();
    let mut out = vec![0u8; 8 * 8 * 3];
    let small = CaptureRequest {
        rect: PixelRect::sized(4, 4),
        use_pack_buffer: true,
    };
    let large = CaptureRequest {
        rect: PixelRect::sized(8, 8),
        use_pack_buffer: true,
    };

    fsm.capture(&mut device, &settings, &small, &mut out)
        .expect("capture");
    let err = fsm
        .capture(&mut device, &settings, &large, &mut out)
        .expect_err("size mismatch");
    assert_eq!(
        err,
        RenderError::CaptureSizeMismatch {
            expected: 48,
            actual: 192
        }
    );
    assert!(!err.is_fatal());
}

#[test]
fn failed_pack_map_recreates_the_buffer() {
    let (mut fsm, mut device) = setup(64, 64);
    let settings = RenderSettings::default();
    let request = CaptureRequest {
        rect: PixelRect::sized(2, 2),
        use_pack_buffer: true,
    };
    let mut out = vec![0u8; 12];

    device.fail_pack_buffer_map(true);
    fsm.capture(&mut device, &settings, &request, &mut out)
        .expect("capture");
    assert_eq!(device.count(|c| matches!(c, GpuCommand::DestroyBuffer(_))), 1);
    assert_eq!(device.count(|c| matches!(c, GpuCommand::CreateBuffer { .. })), 2);
}

#[test]
fn capture_rejects_a_short_output_buffer() {
    let (mut fsm, mut device) = setup(64, 64);
    let request = CaptureRequest {
        rect: PixelRect::sized(4, 4),
        use_pack_buffer: false,
    };
    let mut out = vec![0u8; 10];
    let err = fsm
        .capture(&mut device, &RenderSettings::default(), &request, &mut out)
        .expect_err("too small");
    assert_eq!(
        err,
        RenderError::CaptureBufferTooSmall {
            required: 48,
            provided: 10
        }
    );
    assert!(device.commands().is_empty());
}

#[test]
fn reset_forgets_handles_and_rebuilds_on_next_entry() {
    let (mut fsm, mut device) = setup(320, 240);
    let mut settings = RenderSettings::default();
    fsm.enter_primary(&mut device, &mut settings);

    fsm.reset();
    assert_eq!(fsm.state(), TargetState::Default);
    assert_eq!(fsm.registry().allocation_count(), 0);

    fsm.enter_primary(&mut device, &mut settings);
    assert_eq!(device.count(|c| matches!(c, GpuCommand::CreateFramebuffer(_))), 2);
    assert_eq!(
        device.allocations(RenderTarget::CurrentRender).len(),
        2
    );
}

#[test]
fn shutdown_deletes_framebuffers() {
    let (mut fsm, mut device) = setup(320, 240);
    let mut settings = RenderSettings::default();
    fsm.enter_primary(&mut device, &mut settings);
    fsm.toggle_shadow(
        &mut device,
        &mut settings,
        true,
        false,
        &shadow_viewport(ScreenRect::full(320, 240)),
    );
    assert_eq!(device.live_framebuffers(), 2);

    fsm.shutdown(&mut device);
    assert_eq!(device.live_framebuffers(), 0);
    device.finish();
}
