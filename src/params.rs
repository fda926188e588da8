//! Parameters handed to the external MINIAOD skimming analyzer.
use color_eyre::eyre::{eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::tables::{is_data, is_signal, EraTable, XsecTable};

/// Final states skimmed when none are asked for
pub const SKIM_CHANNELS: [&str; 6] = ["mu4j", "e4j", "mu2j1f", "e2j1f", "mu2f", "e2f"];

/// Final states the analyzer knows how to select
pub const CHANNELS: [&str; 8] = [
    "mu4j", "e4j", "mu2j1f", "e2j1f", "mu2f", "e2f", "MuonIncl", "EleIncl",
];

/// Input collection labels, keyed by the analyzer's parameter name.
const COLLECTIONS: [(&str, &str); 15] = [
    ("jets", "selectedUpdatedPatJetsWithDeepB"),
    ("fatjets", "selectedUpdatedPatJetsAK8WithDeepTags"),
    ("genjets", "slimmedGenJets"),
    ("genfatjets", "slimmedGenJetsAK8"),
    ("mets", "slimmedMETs"),
    ("electrons", "slimmedElectrons"),
    ("muons", "slimmedMuons"),
    ("trigger", "TriggerResults::HLT"),
    ("pileUp", "slimmedAddPileupInfo"),
    ("genInfo", "generator"),
    ("genPart", "prunedGenParticles"),
    ("rho", "fixedGridRhoFastjetAll"),
    ("svtx", "slimmedSecondaryVertices"),
    ("pdf", "pdfweights:pdfVariations"),
    ("scale", "pdfweights:scaleVariations"),
];

/// Modules run before the skimmer, in order
const SEQUENCE: [&str; 21] = [
    "patJetCorrFactorsWithDeepB",
    "updatedPatJetsWithDeepB",
    "pfImpactParameterTagInfosWithDeepB",
    "pfInclusiveSecondaryVertexFinderTagInfosWithDeepB",
    "pfDeepCSVTagInfosWithDeepB",
    "pfDeepFlavourTagInfosWithDeepB",
    "pfDeepFlavourJetTagsWithDeepB",
    "patJetCorrFactorsTransientCorrectedWithDeepB",
    "updatedPatJetsTransientCorrectedWithDeepB",
    "selectedUpdatedPatJetsWithDeepB",
    "patJetCorrFactorsAK8WithDeepTags",
    "updatedPatJetsAK8WithDeepTags",
    "patJetCorrFactorsTransientCorrectedAK8WithDeepTags",
    "pfDeepBoostedJetTagInfosAK8WithDeepTags",
    "pfDeepBoostedJetTagsAK8WithDeepTags",
    "pfDeepBoostedDiscriminatorsJetTagsAK8WithDeepTags",
    "updatedPatJetsTransientCorrectedAK8WithDeepTags",
    "selectedUpdatedPatJetsAK8WithDeepTags",
    "egammaPostRecoSeq",
    "prefiringweight",
    "pdfweights",
];

/// PDF set used for the weight variations
const LHA_ID: u32 = 306000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SkimParameters {
    pub outname: String,
    pub era: String,
    pub channels: Vec<String>,
    pub xsec: f64,
    pub is_data: bool,
    pub is_signal: bool,
    pub global_tag: String,
    pub prefiring_era: String,
    pub egamma_era: String,
    pub lumi_json: Option<PathBuf>,
    pub lhe_source: String,
    pub lha_id: u32,
    pub collections: BTreeMap<String, String>,
    pub sequence: Vec<String>,
}

pub fn validate_channels(channels: &[String]) -> Result<()> {
    match channels.iter().find(|c| !CHANNELS.contains(&c.as_str())) {
        Some(bad) => Err(eyre!(
            "Unknown channel {bad}! Choose from {}",
            CHANNELS.join(", ")
        )),
        None => Ok(()),
    }
}

/// Resolve the analyzer parameters for one output file.
pub fn resolve(
    outname: &str,
    era: &str,
    channels: &[String],
    xsec: &XsecTable,
    eras: &EraTable,
) -> Result<SkimParameters> {
    validate_channels(channels)?;
    let tags = eras.get(era)?;
    let data = is_data(outname);
    let signal = is_signal(outname);

    let mut sequence: Vec<String> = SEQUENCE.iter().map(|m| m.to_string()).collect();
    sequence.push(String::from("skimmer"));

    Ok(SkimParameters {
        outname: outname.to_string(),
        era: era.to_string(),
        channels: channels.to_vec(),
        xsec: xsec.lookup(outname),
        is_data: data,
        is_signal: signal,
        global_tag: tags.global_tag(data).to_string(),
        prefiring_era: tags.prefiring_era.clone(),
        egamma_era: tags.egamma_era.clone(),
        // Good-lumi selection only applies to collision data
        lumi_json: if data { tags.lumi_json.clone() } else { None },
        lhe_source: String::from(if signal { "source" } else { "externalLHEProducer" }),
        lha_id: LHA_ID,
        collections: COLLECTIONS
            .iter()
            .map(|(param, label)| (param.to_string(), label.to_string()))
            .collect(),
        sequence,
    })
}
