use std::collections::HashSet;

use duoshard_graph::{
    load_model, partition, save_model, Dim, ElementType, GraphModel, Initializer, LoadMode,
    OpNode, PartitionConfig, Partitioner, TensorData, ValueInfo, DEFAULT_OPSET, IR_VERSION,
};

const GATE: &str = "/model/layers.1/input_layernorm/output_0";

/// Two-layer toy decoder: embedding, two residual blocks, head.
fn layered_model() -> GraphModel {
    let seq = || vec![Dim::symbolic("batch"), Dim::symbolic("sequence")];
    let hidden = |name: &str| {
        ValueInfo::new(
            name,
            ElementType::Float,
            vec![Dim::symbolic("batch"), Dim::symbolic("sequence"), Dim::Fixed(4)],
        )
    };

    let mut model = GraphModel::new("toy")
        .with_opset("com.microsoft", 1)
        .with_input(ValueInfo::new("input_ids", ElementType::Int64, seq()))
        .with_input(ValueInfo::new("attention_mask", ElementType::Int64, seq()))
        .with_initializer(Initializer::from_f32("model.embed_tokens.weight", vec![8, 4], &[0.5; 32]))
        .with_node(OpNode::new("Gather", ["model.embed_tokens.weight", "input_ids"], ["/model/embed/output_0"]));

    let mut residual = "/model/embed/output_0".to_string();
    for layer in 0..2 {
        let norm_w = format!("model.layers.{}.input_layernorm.weight", layer);
        let proj_w = format!("model.layers.{}.mlp.proj.weight", layer);
        let norm_out = format!("/model/layers.{}/input_layernorm/output_0", layer);
        let proj_out = format!("/model/layers.{}/mlp/output_0", layer);
        let add_out = format!("/model/layers.{}/add/output_0", layer);

        model = model
            .with_initializer(Initializer::from_f32(&norm_w, vec![4], &[1.0; 4]))
            .with_initializer(Initializer::from_f32(&proj_w, vec![4, 4], &[0.25; 16]))
            .with_node(
                OpNode::new("SimplifiedLayerNormalization", [residual.as_str(), norm_w.as_str()], [norm_out.as_str()])
                    .named(&format!("/model/layers.{}/input_layernorm", layer))
                    .with_domain("com.microsoft"),
            )
            .with_node(OpNode::new("MatMul", [norm_out.as_str(), proj_w.as_str()], [proj_out.as_str()]))
            .with_node(OpNode::new("Add", [residual.as_str(), proj_out.as_str()], [add_out.as_str()]))
            .with_value_info(hidden(&norm_out));
        residual = add_out;
    }

    model
        .with_initializer(Initializer::from_f32("lm_head.weight", vec![4, 8], &[0.1; 32]))
        .with_node(OpNode::new("MatMul", [residual.as_str(), "lm_head.weight"], ["logits"]))
        .with_output(ValueInfo::new(
            "logits",
            ElementType::Float,
            vec![Dim::symbolic("batch"), Dim::symbolic("sequence"), Dim::Fixed(8)],
        ))
}

#[test]
fn test_three_node_scenario() {
    let graph = GraphModel::new("abc")
        .with_input(ValueInfo::new("x", ElementType::Float, vec![Dim::Fixed(2)]))
        .with_node(OpNode::new("Relu", ["x"], ["T"]).named("A"))
        .with_node(OpNode::new("Sigmoid", ["T"], ["U"]).named("B"))
        .with_node(OpNode::new("Tanh", ["U"], ["V"]).named("C"))
        .with_output(ValueInfo::new("logits", ElementType::Float, vec![Dim::Fixed(2)]));

    let (early, late) = partition(&graph, "T").unwrap();

    let names = |m: &GraphModel| m.nodes.iter().map(|n| n.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&early), ["A"]);
    assert_eq!(names(&late), ["B", "C"]);

    assert_eq!(early.graph_outputs.len(), 1);
    assert_eq!(early.graph_outputs[0].name, "T");

    let late_inputs: HashSet<&str> = late.graph_inputs.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(late_inputs, HashSet::from(["T"]));
    assert_eq!(late.graph_outputs[0].name, "logits");
}

#[test]
fn test_partition_completeness() {
    let graph = layered_model();
    let (early, late) = partition(&graph, GATE).unwrap();

    // Node sets are disjoint here and together rebuild the source in order
    let mut rebuilt = early.nodes.clone();
    rebuilt.extend(late.nodes.iter().cloned());
    assert_eq!(rebuilt, graph.nodes);
}

#[test]
fn test_input_resolution_soundness() {
    let graph = layered_model();
    let (early, late) = partition(&graph, GATE).unwrap();

    early.validate().unwrap();
    late.validate().unwrap();

    // Only weights the shard reads are cloned
    let early_weights = early.initializer_names();
    assert!(early_weights.contains("model.layers.0.mlp.proj.weight"));
    assert!(!early_weights.contains("model.layers.1.mlp.proj.weight"));
    assert!(!early_weights.contains("lm_head.weight"));

    let late_weights = late.initializer_names();
    assert!(late_weights.contains("lm_head.weight"));
    assert!(!late_weights.contains("model.embed_tokens.weight"));
}

#[test]
fn test_cross_boundary_metadata() {
    let graph = layered_model();
    let (early, late) = partition(&graph, GATE).unwrap();

    // The early output copies the recorded type of the gate
    assert_eq!(early.graph_outputs[0], *graph.find_value_info(GATE).unwrap());

    // The residual stream crosses the cut with no type record: declared, not invented
    let residual = late.graph_input("/model/layers.0/add/output_0").unwrap();
    assert_eq!(residual.element_type, ElementType::Undefined);
    assert_eq!(residual.shape, None);

    let gate = late.graph_input(GATE).unwrap();
    assert_eq!(gate.shape.as_ref().unwrap()[2], Dim::Fixed(4));

    // Final output copied verbatim
    assert_eq!(late.graph_outputs, graph.graph_outputs);
}

#[test]
fn test_weight_wins_over_shadowing_input() {
    let graph = GraphModel::new("shadow")
        .with_input(ValueInfo::new("x", ElementType::Float, vec![Dim::Fixed(1)]))
        .with_input(ValueInfo::new("w", ElementType::Float, vec![Dim::Fixed(1)]))
        .with_initializer(Initializer::from_f32("w", vec![1], &[3.0]))
        .with_node(OpNode::new("Relu", ["x"], ["T"]))
        .with_node(OpNode::new("Mul", ["T", "w"], ["logits"]))
        .with_output(ValueInfo::new("logits", ElementType::Float, vec![Dim::Fixed(1)]));

    let (_, late) = partition(&graph, "T").unwrap();
    assert!(late.initializer("w").is_some());
    assert!(late.graph_input("w").is_none());
    assert!(late.graph_input("T").is_some());
}

#[test]
fn test_versioning_and_custom_domains() {
    let mut graph = layered_model();
    graph.ir_version = 10;
    graph = graph.with_opset("", 17);

    let (early, late) = partition(&graph, GATE).unwrap();
    for shard in [&early, &late] {
        assert_eq!(shard.ir_version, IR_VERSION);
        assert_eq!(shard.default_opset(), Some(DEFAULT_OPSET));
        let custom: Vec<&str> = shard.custom_opsets().map(|o| o.domain.as_str()).collect();
        assert_eq!(custom, ["com.microsoft"]);
    }

    // Contrib ops keep their domain on both sides of the cut
    let late_norm = late
        .nodes
        .iter()
        .find(|n| n.op_type == "SimplifiedLayerNormalization")
        .unwrap();
    assert_eq!(late_norm.domain, "com.microsoft");
    assert_eq!(late.producer_of(GATE), None, "the gate is an input of the late shard");
    assert_eq!(late.first_consumer_of(GATE), Some(0));
    assert_eq!(early.producer_of(GATE), Some(early.nodes.len() - 1));
}

#[test]
fn test_shards_save_to_separate_blobs() {
    let dir = std::env::temp_dir().join(format!("duoshard-shards-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let graph = layered_model();
    let config = PartitionConfig::new(GATE).with_boundary_rename(true);
    let pair = Partitioner::new(config).partition(&graph).unwrap();

    save_model(&pair.early, None, dir.join("laptop.graph.json")).unwrap();
    save_model(&pair.late, None, dir.join("server.graph.json")).unwrap();
    assert!(dir.join("laptop.graph.json.data").exists());
    assert!(dir.join("server.graph.json.data").exists());

    let late = load_model(dir.join("server.graph.json"), LoadMode::DescriptorOnly).unwrap();
    for init in &late.initializers {
        match &init.data {
            TensorData::External(ext) => assert_eq!(ext.location, "server.graph.json.data"),
            TensorData::Inline(_) => panic!("payload inlined in descriptor"),
        }
    }
    assert!(late.graph_input(&format!("{}_input", GATE)).is_some());

    let early = load_model(dir.join("laptop.graph.json"), LoadMode::WithData).unwrap();
    assert_eq!(
        early.initializer("model.embed_tokens.weight"),
        graph.initializer("model.embed_tokens.weight")
    );
    std::fs::remove_dir_all(dir).ok();
}
