use renderer::{
    compositor::under, BatchList, MeshBatch, OitError, PixelBuffer, RendererConfig, Slot,
    SoftwareDevice, StochasticTransparency, TableParams, TechniqueMode, TextureId,
};

const SIZE: u32 = 4;
const BACKGROUND: [f32; 3] = [0.0, 0.0, 1.0];

fn config(mode: TechniqueMode, sample_count: u32) -> RendererConfig {
    RendererConfig {
        mode,
        table: TableParams {
            sample_count,
            dither_table_size: 512,
            alpha_levels: 256,
            seed: 7,
        },
        temporal_jitter: false,
        width: SIZE,
        height: SIZE,
        background: BACKGROUND,
    }
}

fn render(mode: TechniqueMode, scene: &BatchList) -> PixelBuffer {
    let mut renderer = StochasticTransparency::new(SoftwareDevice::new(), config(mode, 8)).unwrap();
    renderer.render_frame(scene).unwrap();
    renderer.read_output().unwrap()
}

fn layer(surface: u32, depth: f32, rgb: [f32; 3], alpha: f32) -> MeshBatch {
    let [r, g, b] = rgb;
    MeshBatch::full_screen(surface, depth, [r, g, b, alpha])
}

fn assert_close(actual: [f32; 4], expected: [f32; 3]) {
    for channel in 0..3 {
        assert!(
            (actual[channel] - expected[channel]).abs() < 1e-5,
            "channel {channel}: {actual:?} vs {expected:?}"
        );
    }
    assert_eq!(actual[3], 1.0);
}

fn max_difference(a: &PixelBuffer, b: &PixelBuffer) -> f32 {
    a.pixels
        .iter()
        .zip(&b.pixels)
        .flat_map(|(x, y)| (0..4).map(move |c| (x[c] - y[c]).abs()))
        .fold(0.0, f32::max)
}

#[test]
fn empty_scene_shows_background() {
    for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
        let output = render(mode, &BatchList::new());
        for pixel in &output.pixels {
            assert_close(*pixel, BACKGROUND);
        }
    }
}

#[test]
fn fully_opaque_layer_replaces_background() {
    let red = [1.0, 0.0, 0.0];
    let scene = BatchList::with_transparent(vec![layer(1, 0.5, red, 1.0)]);
    for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
        let output = render(mode, &scene);
        for pixel in &output.pixels {
            assert_close(*pixel, red);
        }
    }
}

#[test]
fn two_layers_match_sorted_under_operator_in_either_order() {
    let near = ([1.0, 0.0, 0.0], 0.5);
    let far = ([0.0, 1.0, 0.0], 0.25);
    let expected = under(BACKGROUND, &[near, far]);

    let front = layer(1, 0.25, near.0, near.1);
    let back = layer(2, 0.75, far.0, far.1);
    for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
        for transparent in [
            vec![front.clone(), back.clone()],
            vec![back.clone(), front.clone()],
        ] {
            let output = render(mode, &BatchList::with_transparent(transparent));
            for pixel in &output.pixels {
                assert_close(*pixel, expected);
            }
        }
    }
}

fn mean_color(output: &PixelBuffer) -> [f32; 3] {
    let mut sum = [0.0f64; 3];
    for pixel in &output.pixels {
        for channel in 0..3 {
            sum[channel] += f64::from(pixel[channel]);
        }
    }
    let count = output.pixels.len() as f64;
    sum.map(|total| (total / count) as f32)
}

#[test]
fn stochastic_estimate_converges_to_under_operator() {
    let near_color = [1.0, 0.0, 0.0];
    let far_color = [0.0, 1.0, 0.0];
    for (near_alpha, far_alpha) in [(0.3, 0.6), (0.7, 0.2), (0.1, 0.9)] {
        let expected = under(
            BACKGROUND,
            &[(near_color, near_alpha), (far_color, far_alpha)],
        );
        let front = layer(1, 0.25, near_color, near_alpha);
        let back = layer(2, 0.75, far_color, far_alpha);
        for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
            let settings = RendererConfig {
                table: TableParams {
                    dither_table_size: 2048,
                    ..config(mode, 8).table
                },
                width: 128,
                height: 128,
                ..config(mode, 8)
            };
            for transparent in [
                vec![front.clone(), back.clone()],
                vec![back.clone(), front.clone()],
            ] {
                let mut renderer =
                    StochasticTransparency::new(SoftwareDevice::new(), settings.clone()).unwrap();
                renderer
                    .render_frame(&BatchList::with_transparent(transparent))
                    .unwrap();
                let mean = mean_color(&renderer.read_output().unwrap());
                for channel in 0..3 {
                    assert!(
                        (mean[channel] - expected[channel]).abs() < 5e-3,
                        "{mode} alphas ({near_alpha}, {far_alpha}): {mean:?} vs {expected:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn submission_order_does_not_change_the_image() {
    let layers = vec![
        layer(1, 0.2, [1.0, 0.0, 0.0], 0.3),
        MeshBatch::quad(2, [-1.0, -1.0, 0.0, 1.0], 0.4, [0.0, 1.0, 0.0, 0.6]),
        layer(3, 0.6, [1.0, 1.0, 0.0], 0.45),
        MeshBatch::quad(4, [-0.5, -1.0, 1.0, 0.5], 0.1, [0.2, 0.2, 0.2, 0.8]),
    ];
    let mut reversed = layers.clone();
    reversed.reverse();
    let mut rotated = layers.clone();
    rotated.rotate_left(1);

    for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
        let reference = render(mode, &BatchList::with_transparent(layers.clone()));
        for other in [&reversed, &rotated] {
            let output = render(mode, &BatchList::with_transparent(other.clone()));
            let diff = max_difference(&reference, &output);
            assert!(diff < 1e-5, "{mode}: max difference {diff}");
        }
    }
}

#[test]
fn both_modes_produce_the_same_image() {
    let scene = BatchList::with_transparent(vec![
        layer(1, 0.3, [1.0, 0.5, 0.0], 0.4),
        layer(2, 0.5, [0.0, 0.5, 1.0], 0.7),
        MeshBatch::quad(3, [-1.0, -1.0, 0.5, 0.5], 0.2, [0.9, 0.9, 0.9, 0.2]),
    ]);
    let three = render(TechniqueMode::ThreeTarget, &scene);
    let merged = render(TechniqueMode::TwoTargetMerged, &scene);
    let diff = max_difference(&three, &merged);
    assert!(diff < 1e-5, "max difference {diff}");
}

#[test]
fn transmittance_stays_in_unit_range() {
    let scene = BatchList::with_transparent(
        (0..6)
            .map(|i| layer(i, 0.1 + i as f32 * 0.1, [1.0, 1.0, 1.0], 0.35))
            .collect(),
    );
    let mut renderer = StochasticTransparency::new(
        SoftwareDevice::new(),
        config(TechniqueMode::ThreeTarget, 8),
    )
    .unwrap();
    renderer.render_frame(&scene).unwrap();
    let transmittance = renderer.targets().get(Slot::Transmittance).unwrap();
    let values = renderer.read_texture(transmittance).unwrap();
    for pixel in &values.pixels {
        assert!((0.0..=1.0).contains(&pixel[0]), "{pixel:?}");
        let exact = 0.65f32.powi(6);
        assert!((pixel[0] - exact).abs() < 1e-5, "{pixel:?}");
    }
}

#[test]
fn opaque_geometry_hides_layers_behind_it() {
    let green = [0.0, 1.0, 0.0];
    let scene = BatchList {
        opaque: vec![MeshBatch::full_screen(10, 0.5, [0.0, 1.0, 0.0, 1.0])],
        transparent: vec![layer(1, 0.75, [1.0, 0.0, 0.0], 0.5)],
    };
    for mode in [TechniqueMode::ThreeTarget, TechniqueMode::TwoTargetMerged] {
        let output = render(mode, &scene);
        for pixel in &output.pixels {
            assert_close(*pixel, green);
        }
    }
}

#[test]
fn frame_reports_mode_pass_sequence() {
    let scene = BatchList::with_transparent(vec![layer(1, 0.5, [1.0, 0.0, 0.0], 0.5)]);
    let mut three = StochasticTransparency::new(
        SoftwareDevice::new(),
        config(TechniqueMode::ThreeTarget, 4),
    )
    .unwrap();
    let report = three.render_frame(&scene).unwrap();
    assert_eq!(
        report.passes,
        [
            "begin",
            "opaque",
            "stochastic-coverage",
            "transmittance",
            "accumulate",
            "composite"
        ]
    );
    assert_eq!(report.transparent_batches, 1);

    let mut merged = StochasticTransparency::new(
        SoftwareDevice::new(),
        config(TechniqueMode::TwoTargetMerged, 4),
    )
    .unwrap();
    let report = merged.render_frame(&scene).unwrap();
    assert_eq!(
        report.passes,
        [
            "begin",
            "opaque",
            "stochastic-coverage",
            "accumulate-merged",
            "composite"
        ]
    );
    assert_eq!(merged.frames_rendered(), 1);
}

#[test]
fn lost_device_disables_the_renderer() {
    let scene = BatchList::with_transparent(vec![layer(1, 0.5, [1.0, 0.0, 0.0], 0.5)]);
    let mut renderer = StochasticTransparency::new(
        SoftwareDevice::new(),
        config(TechniqueMode::TwoTargetMerged, 8),
    )
    .unwrap();
    renderer.render_frame(&scene).unwrap();

    renderer.device_mut().lose_device("driver reset");
    assert!(matches!(
        renderer.render_frame(&scene),
        Err(OitError::DeviceLost(_))
    ));
    assert!(renderer.is_lost());
    assert!(matches!(
        renderer.render_frame(&scene),
        Err(OitError::DeviceLost(_))
    ));
    assert!(matches!(
        renderer.read_output(),
        Err(OitError::DeviceLost(_))
    ));
    assert_eq!(renderer.frames_rendered(), 1);
}

#[test]
fn failed_frame_is_abandoned_and_the_next_frame_succeeds() {
    let scene = BatchList::with_transparent(vec![layer(1, 0.5, [1.0, 0.0, 0.0], 0.5)]);
    let mut renderer = StochasticTransparency::new(
        SoftwareDevice::new(),
        config(TechniqueMode::ThreeTarget, 8),
    )
    .unwrap();

    match renderer.render_frame_to(&scene, TextureId::new(999)) {
        Err(OitError::Frame { pass, .. }) => assert_eq!(pass, "composite"),
        other => panic!("expected a frame error, got {other:?}"),
    }
    assert!(!renderer.is_lost());
    assert_eq!(renderer.frames_rendered(), 0);

    let report = renderer.render_frame(&scene).unwrap();
    assert_eq!(
        report.passes,
        [
            "begin",
            "opaque",
            "stochastic-coverage",
            "transmittance",
            "accumulate",
            "composite"
        ]
    );
    assert_eq!(renderer.frames_rendered(), 1);
    let expected = under(BACKGROUND, &[([1.0, 0.0, 0.0], 0.5)]);
    for pixel in &renderer.read_output().unwrap().pixels {
        assert_close(*pixel, expected);
    }
}

#[test]
fn unsupported_sample_count_fails_before_allocation() {
    let mut device = SoftwareDevice::with_sample_counts(vec![1, 2, 4]);
    let err = StochasticTransparency::new(&mut device, config(TechniqueMode::ThreeTarget, 8))
        .err()
        .unwrap();
    assert!(matches!(err, OitError::Configuration(_)), "{err}");
    assert_eq!(device.texture_count(), 0);
}

#[test]
fn dropping_the_renderer_releases_every_texture() {
    let mut device = SoftwareDevice::new();
    {
        let mut renderer =
            StochasticTransparency::new(&mut device, config(TechniqueMode::ThreeTarget, 4))
                .unwrap();
        renderer.render_frame(&BatchList::new()).unwrap();
        assert!(renderer.device().texture_count() > 0);
    }
    assert_eq!(device.texture_count(), 0);
    assert_eq!(device.stats().frames, 1);
}

#[test]
fn resize_recreates_targets() {
    let mut device = SoftwareDevice::new();
    let mut renderer =
        StochasticTransparency::new(&mut device, config(TechniqueMode::TwoTargetMerged, 4))
            .unwrap();
    let before = renderer.device().texture_count();
    renderer.resize(8, 2).unwrap();
    assert_eq!(renderer.targets().size(), (8, 2));
    assert_eq!(renderer.device().texture_count(), before);

    renderer.render_frame(&BatchList::new()).unwrap();
    let output = renderer.read_output().unwrap();
    assert_eq!((output.width, output.height), (8, 2));
    assert!(matches!(
        renderer.resize(0, 2),
        Err(OitError::Configuration(_))
    ));
}

#[test]
fn temporal_jitter_changes_the_dither_offset() {
    let mut settings = config(TechniqueMode::TwoTargetMerged, 4);
    settings.temporal_jitter = true;
    let mut renderer = StochasticTransparency::new(SoftwareDevice::new(), settings).unwrap();
    let scene = BatchList::new();
    let first = renderer.render_frame(&scene).unwrap();
    let second = renderer.render_frame(&scene).unwrap();
    assert_ne!(first.random_offset, second.random_offset);
    assert_eq!(second.frame, 1);

    let mut still = StochasticTransparency::new(
        SoftwareDevice::new(),
        config(TechniqueMode::TwoTargetMerged, 4),
    )
    .unwrap();
    assert_eq!(still.render_frame(&scene).unwrap().random_offset, 0);
}
