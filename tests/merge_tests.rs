/// Merge engine property tests
///
/// Linearity, zero strength, resolution determinism and the
/// end-to-end single-layer bake

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device, Tensor};
    use lora_bake::tensor_utils::to_f32_vec;
    use lora_bake::{Accumulator, Finalizer, KeyResolver, PairOutcome, SkipReason, WeightSet};

    fn tensor(data: Vec<f32>, shape: &[usize]) -> Tensor {
        Tensor::from_vec(data, shape, &Device::Cpu).expect("Failed to create tensor")
    }

    fn base() -> WeightSet {
        let mut w = WeightSet::new();
        let data: Vec<f32> = (0..16).map(|i| i as f32 * 0.25).collect();
        w.insert("layer.weight".into(), tensor(data, &[4, 4]));
        w.insert(
            "model.diffusion_model.blocks.0.ff.weight".into(),
            tensor(vec![0.5; 12], &[3, 4]),
        );
        w
    }

    fn adapter() -> WeightSet {
        let mut a = WeightSet::new();
        a.insert(
            "lora_unet_layer.lora_down.weight".into(),
            tensor(vec![0.1, 0.2, 0.3, 0.4, -0.1, -0.2, -0.3, -0.4], &[2, 4]),
        );
        a.insert(
            "lora_unet_layer.lora_up.weight".into(),
            tensor(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, -1.0], &[4, 2]),
        );
        a.insert("lora_unet_layer.alpha".into(), Tensor::new(2f32, &Device::Cpu).expect("alpha"));
        a.insert(
            "lora_unet_blocks_0_ff.lora_A.weight".into(),
            tensor(vec![0.5, -0.5, 0.25, 1.0], &[1, 4]),
        );
        a.insert(
            "lora_unet_blocks_0_ff.lora_B.weight".into(),
            tensor(vec![1.0, 2.0, 3.0], &[3, 1]),
        );
        a
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        assert_eq!(a.dims(), b.dims());
        let a = to_f32_vec(a).expect("read");
        let b = to_f32_vec(b).expect("read");
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_end_to_end_single_layer() {
        let base = base();
        let adapter = adapter();

        let (merged, report) = Accumulator::default().apply_adapter(&base, &adapter, 1.0);
        assert_eq!(report.applied(), 2);

        // delta = up @ down * (2 / 2) * 1.0
        let up = adapter["lora_unet_layer.lora_up.weight"].clone();
        let down = adapter["lora_unet_layer.lora_down.weight"].clone();
        let expected = base["layer.weight"]
            .add(&up.matmul(&down).expect("matmul"))
            .expect("add");
        assert_close(&merged["layer.weight"], &expected);

        let out = Finalizer::default().finalize(merged).expect("finalize");
        assert_eq!(out["layer.weight"].dtype(), DType::BF16);
        let expected_bf16 = expected.to_dtype(DType::BF16).expect("cast");
        assert_eq!(
            to_f32_vec(&out["layer.weight"]).expect("read"),
            to_f32_vec(&expected_bf16).expect("read")
        );
    }

    #[test]
    fn test_zero_strength_leaves_base_unchanged() {
        let base = base();
        let (merged, report) = Accumulator::default().apply_adapter(&base, &adapter(), 0.0);

        assert_eq!(report.applied(), 2);
        for (name, tensor) in &base {
            assert_close(&merged[name], tensor);
        }
    }

    #[test]
    fn test_sequential_strengths_add_linearly() {
        let base = base();
        let adapter = adapter();
        let acc = Accumulator::default();

        let (twice, _) = acc.apply_all(&base, [(&adapter, 0.3), (&adapter, 0.9)]);
        let (once, _) = acc.apply_adapter(&base, &adapter, 1.2);

        for name in base.keys() {
            assert_close(&twice[name], &once[name]);
        }
    }

    #[test]
    fn test_later_adapters_see_earlier_updates() {
        let base = base();
        let adapter = adapter();
        let acc = Accumulator::default();

        let (first, _) = acc.apply_adapter(&base, &adapter, 1.0);
        let (second, _) = acc.apply_adapter(&first, &adapter, 1.0);
        let (chained, reports) = acc.apply_all(&base, [(&adapter, 1.0), (&adapter, 1.0)]);

        assert_eq!(reports.len(), 2);
        assert_close(&chained["layer.weight"], &second["layer.weight"]);
    }

    #[test]
    fn test_unresolvable_group_changes_nothing() {
        let base = base();
        let mut adapter = WeightSet::new();
        adapter.insert(
            "lora_te_text_model_q.lora_down.weight".into(),
            tensor(vec![1.0; 4], &[1, 4]),
        );
        adapter.insert(
            "lora_te_text_model_q.lora_up.weight".into(),
            tensor(vec![1.0; 4], &[4, 1]),
        );

        let (merged, report) = Accumulator::default().apply_adapter(&base, &adapter, 1.0);

        assert_eq!(report.applied(), 0);
        assert_eq!(report.total(), 1);

        let mut before: Vec<_> = base.keys().collect();
        let mut after: Vec<_> = merged.keys().collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
        for (name, tensor) in &base {
            assert_close(&merged[name], tensor);
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let base = base();
        let resolver = KeyResolver::default();

        let first = resolver.resolve("lora_unet_blocks_0_ff", &base);
        for _ in 0..10 {
            assert_eq!(resolver.resolve("lora_unet_blocks_0_ff", &base), first);
        }
        assert_eq!(
            first.expect("resolved").key,
            "model.diffusion_model.blocks.0.ff.weight"
        );
    }

    #[test]
    fn test_applied_targets_keep_their_shape() {
        let base = base();
        let (merged, report) = Accumulator::default().apply_adapter(&base, &adapter(), 1.0);

        for outcome in &report.outcomes {
            if let lora_bake::PairOutcome::Applied { target, .. } = outcome {
                assert_eq!(merged[target].dims(), base[target].dims());
            }
        }
    }

    /// Base with two linear targets, `a.weight` and `b.weight`
    fn two_target_base() -> WeightSet {
        let mut w = WeightSet::new();
        w.insert("a.weight".into(), tensor(vec![0.0; 16], &[4, 4]));
        w.insert("b.weight".into(), tensor(vec![0.0; 16], &[4, 4]));
        w
    }

    /// Adapter where group `a` uses the given factors and group `b` is a valid rank-1 pair
    fn adapter_with_broken_a(down: Tensor, up: Tensor, alpha: Option<Tensor>) -> WeightSet {
        let mut a = WeightSet::new();
        a.insert("lora_unet_a.lora_down.weight".into(), down);
        a.insert("lora_unet_a.lora_up.weight".into(), up);
        if let Some(alpha) = alpha {
            a.insert("lora_unet_a.alpha".into(), alpha);
        }
        a.insert("lora_unet_b.lora_down.weight".into(), tensor(vec![1.0; 4], &[1, 4]));
        a.insert("lora_unet_b.lora_up.weight".into(), tensor(vec![1.0; 4], &[4, 1]));
        a
    }

    fn assert_a_failed_b_applied(adapter: &WeightSet) {
        let base = two_target_base();
        let (merged, report) = Accumulator::default().apply_adapter(&base, adapter, 1.0);

        assert_eq!(report.total(), 2);
        assert_eq!(report.applied(), 1);
        assert!(
            matches!(
                &report.outcomes[0],
                PairOutcome::Skipped {
                    group,
                    reason: SkipReason::Compute(_),
                } if group == "lora_unet_a"
            ),
            "unexpected outcome {:?}",
            report.outcomes[0]
        );
        assert!(matches!(
            &report.outcomes[1],
            PairOutcome::Applied { target, .. } if target == "b.weight"
        ));

        for v in to_f32_vec(&merged["a.weight"]).expect("read") {
            assert_eq!(v, 0.0);
        }
        for v in to_f32_vec(&merged["b.weight"]).expect("read") {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_non_scalar_alpha_skips_only_its_pair() {
        let adapter = adapter_with_broken_a(
            tensor(vec![0.5; 8], &[2, 4]),
            tensor(vec![0.5; 8], &[4, 2]),
            Some(tensor(vec![1.0, 2.0, 3.0], &[3])),
        );
        assert_a_failed_b_applied(&adapter);
    }

    #[test]
    fn test_rank_mismatch_skips_only_its_pair() {
        let adapter = adapter_with_broken_a(
            tensor(vec![0.5; 8], &[2, 4]),
            tensor(vec![0.5; 12], &[4, 3]),
            None,
        );
        assert_a_failed_b_applied(&adapter);
    }
}
